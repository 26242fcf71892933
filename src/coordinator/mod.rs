//! Registry coordinator: master election and id allocation
//!
//! The coordinator is responsible for:
//! - Electing exactly one eligible node as master (`elector`)
//! - Handing out unique, increasing schema ids in batches (`allocator`)
//! - Fencing writes on non-master nodes (`registry`)
//! - Node assembly and the admin API (`server`, `http`)

pub mod allocator;
pub mod elector;
pub mod http;
pub mod registry;
pub mod server;

pub use allocator::{reconcile, IdAllocator, IdBatch};
pub use elector::{ElectionState, MasterElector, MasterLease, MastershipListener, Phase, Role};
pub use registry::SchemaRegistry;
pub use server::RegistryNode;
