//! Persisted object model for the qubesd daemon.
//!
//! Everything that ends up in `qubes.xml` lives here: the typed property
//! framework, labels, domains with their features, tags, firewall, volume
//! configurations and device assignments, and the staged XML store
//! loader/saver. Runtime concerns (hypervisor, storage drivers, admin
//! API) live in the `qubesd` crate on top of this one.

mod device;
mod domain;
mod features;
mod firewall;
mod label;
mod lock;
mod property;
mod store;
mod tags;
mod volume;
mod xml;

pub use device::*;
pub use domain::*;
pub use features::*;
pub use firewall::*;
pub use label::*;
pub use lock::*;
pub use property::*;
pub use store::*;
pub use tags::*;
pub use volume::*;
pub use xml::*;
