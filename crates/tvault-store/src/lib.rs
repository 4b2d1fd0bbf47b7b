//! tvault-store: the remote message store contract and an OpenDAL backend

pub mod client;
pub mod opendal_store;
pub mod operator;

pub use client::{ChannelInfo, Message, MessageFilter, RemoteStore};
pub use opendal_store::OpendalStore;
pub use operator::{build_operator, build_store, expand_home};
