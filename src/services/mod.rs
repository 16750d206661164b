pub mod blob_store;
pub mod dedup_engine;
pub mod hasher;
pub mod key_locks;
pub mod link_promotion;
pub mod metadata_index;
pub mod naming;

#[cfg(test)]
pub(crate) mod test_support;
