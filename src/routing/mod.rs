//! Path classification and rewriting for the federation proxy

mod path;

pub use path::{classify_path, rewritten_path, strip_api_prefix, PathTarget};
