pub mod azure;
pub mod local_dir;

pub use azure::AzureBlobStorage;
pub use local_dir::LocalDirStorage;
