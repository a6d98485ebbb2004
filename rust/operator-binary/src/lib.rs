pub mod admission;
pub mod certificate_controller;
pub mod client;
pub mod crd;
pub mod events;
pub mod issuer;
pub mod issuer_controller;
pub mod pki;
pub mod restart;
pub mod scheduler;
pub mod secret;
pub mod utils;
pub mod validation;
pub mod work_queue;

#[cfg(test)]
mod test_support;

pub const OPERATOR_NAME: &str = "certificates.stackable.tech";
