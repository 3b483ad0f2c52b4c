//! Custom Resource Definitions for the RGW standalone operator

mod object_store;


pub use object_store::{
    GatewaySpec, MultisiteSpec, ObjectStore, ObjectStoreSpec, ObjectStoreStatus, SiteRole,
};
