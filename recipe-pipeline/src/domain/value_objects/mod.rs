//! Domain value objects.
//!
//! Value objects are immutable objects that represent concepts in the domain
//! and are defined by their attributes rather than identity.

mod retry_policy;

pub use retry_policy::RetryPolicy;
