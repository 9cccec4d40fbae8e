pub mod http;
pub mod sse;
pub(crate) mod task;

#[doc(hidden)]
pub mod test_support;
