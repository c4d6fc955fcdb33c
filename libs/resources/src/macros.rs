//! Macro for defining typed resource kinds.

/// Define a resource kind with a given discriminator and scope.
///
/// This generates a struct with:
/// - `meta`, `spec`, and `status` fields
/// - `new(meta, spec)` starting from a default status
/// - `Serialize`, `Deserialize`, `Clone`, `Default`, `PartialEq`
/// - a [`Kind`](crate::Kind) implementation
///
/// # Example
///
/// ```ignore
/// define_kind!(
///     /// A scoping container.
///     Group, "group", Scope::Cluster, GroupSpec, GroupStatus
/// );
/// ```
#[macro_export]
macro_rules! define_kind {
    ($(#[$doc:meta])* $name:ident, $kind:literal, $scope:expr, $spec:ty, $status:ty) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Default, PartialEq, ::serde::Serialize, ::serde::Deserialize)]
        pub struct $name {
            /// Common envelope.
            pub meta: $crate::Meta,

            /// Declared state.
            #[serde(default)]
            pub spec: $spec,

            /// Observed state.
            #[serde(default)]
            pub status: $status,
        }

        impl $name {
            /// Create a resource with a default status.
            #[must_use]
            pub fn new(meta: $crate::Meta, spec: $spec) -> Self {
                Self {
                    meta,
                    spec,
                    status: <$status>::default(),
                }
            }
        }

        impl $crate::Kind for $name {
            const KIND: &'static str = $kind;
            const SCOPE: $crate::Scope = $scope;

            fn meta(&self) -> &$crate::Meta {
                &self.meta
            }

            fn meta_mut(&mut self) -> &mut $crate::Meta {
                &mut self.meta
            }
        }
    };
}
