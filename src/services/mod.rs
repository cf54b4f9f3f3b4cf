pub mod blob_store;
pub mod image_service;
pub mod metadata_index;

#[cfg(test)]
pub(crate) mod testing;
