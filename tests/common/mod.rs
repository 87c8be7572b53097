#![allow(dead_code, unused_imports)]

pub use dagflow_test_utils::builders;
pub use dagflow_test_utils::fake_executor;
pub use dagflow_test_utils::harness;
pub use dagflow_test_utils::{init_tracing, with_timeout};
