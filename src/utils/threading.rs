//! # Threading Configuration
//!
//! Rayon pools for the per-worker data loader. Each worker process builds
//! its own pool so loader threads never outlive or cross workers.

use crate::error::{PolishError, Result};

/// Create a named thread pool with `n_threads` threads (at least one).
pub fn build_thread_pool(n_threads: usize, name: &str) -> Result<rayon::ThreadPool> {
    let prefix = name.to_string();
    rayon::ThreadPoolBuilder::new()
        .num_threads(n_threads.max(1))
        .thread_name(move |i| format!("{}-{}", prefix, i))
        .build()
        .map_err(|e| PolishError::config(format!("Failed to create thread pool: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_thread_names() {
        let pool = build_thread_pool(2, "loader-r0").unwrap();
        assert_eq!(pool.current_num_threads(), 2);
        let name = pool.install(|| std::thread::current().name().map(str::to_string));
        assert!(name.unwrap().starts_with("loader-r0-"));
    }

    #[test]
    fn test_zero_threads_clamped() {
        let pool = build_thread_pool(0, "x").unwrap();
        assert_eq!(pool.current_num_threads(), 1);
    }
}
