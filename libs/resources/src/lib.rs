//! # fleet-resources
//!
//! The resource model shared by the store and every controller.
//!
//! ## Envelope
//!
//! Every stored resource is `{meta, spec, status}`:
//!
//! - `meta` carries the scoping keys (group, namespace, id), annotations,
//!   labels, the delete state, and the resource hash.
//! - `spec` is declared state, written by the API.
//! - `status` is observed state, written by the owning controller.
//!
//! ## Key layout
//!
//! ```text
//! <kind>/<group>/<namespace>/<id>   namespace-scoped kinds
//! <kind>/<group>/<id>               group-scoped kinds (Namespace, Image, ImageEntity)
//! <kind>/<id>                       cluster-scoped kinds (Group, Node)
//! ```
//!
//! Each kind is its own Rust type implementing [`Kind`], so reading a key
//! into the wrong type is a deserialization error rather than a bad cast.

mod error;
mod kind;
mod macros;
mod meta;
mod size;
mod types;

pub use error::ResourceError;
pub use kind::{key_for, prefix_for, validate_segment, Kind, Scope, HASH_POINTER};
pub use meta::*;
pub use size::{format_size, parse_size, GIB, KIB, MIB, TIB};
pub use types::*;
