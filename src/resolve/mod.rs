//! Endpoint and client identity resolution
//!
//! Both resolvers run before the first event of a page can be sent: the
//! domain resolver turns the site's `customize.json` into request URLs and
//! the IP resolver produces the `X-Client-IP` value.

pub mod domain;
pub mod ip;
pub mod validate;

pub use domain::{DomainError, DomainResolver, Domains};
pub use ip::{IpResolver, IP_CACHE_KEY};
pub use validate::{is_valid_ip, IpValidator, UNKNOWN_IP};
