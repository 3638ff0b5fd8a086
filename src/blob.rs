//! Blob store contract.

use async_trait::async_trait;

use crate::error::Result;

/// Client seam for durable binary storage. Keys are namespaced by category
/// (`figures`, `videos`); uploads are idempotent per (category, key).
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Upload bytes under a category/key pair.
    async fn upload_file(&self, category: &str, key: &str, bytes: Vec<u8>) -> Result<()>;

    /// Public URL for a stored object. Pure function of (category, key).
    fn public_url(&self, category: &str, key: &str) -> String;
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// In-memory blob store for tests.
    #[derive(Default)]
    pub struct MemoryBlobStore {
        pub objects: Mutex<HashMap<(String, String), Vec<u8>>>,
    }

    #[async_trait]
    impl BlobStore for MemoryBlobStore {
        async fn upload_file(&self, category: &str, key: &str, bytes: Vec<u8>) -> Result<()> {
            self.objects
                .lock()
                .unwrap()
                .insert((category.to_owned(), key.to_owned()), bytes);
            Ok(())
        }

        fn public_url(&self, category: &str, key: &str) -> String {
            format!("memory://{category}/{key}")
        }
    }
}
