/// Version is a graph-wide monotonically increasing number, advanced whenever inputs change.
///
/// Nodes record the version at which their value last changed and the version at which they
/// were last evaluated. Comparing the two across an edge tells whether a dependency changed
/// after its dependent was computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Version(pub u64);

impl Version {
    /// The version of an empty graph.
    pub const ZERO: Version = Version(0);

    /// The version following this one.
    #[must_use]
    pub fn next(self) -> Self {
        Version(self.0 + 1)
    }
}
