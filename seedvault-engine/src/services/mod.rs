pub mod blob_store;
pub mod export;
pub mod import;
pub mod legacy_blobs;
pub mod progress;
pub mod restore;
pub mod retention;
pub mod run_lifecycle;
pub mod run_worker;

#[cfg(test)]
pub(crate) mod test_support;
