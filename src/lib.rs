pub mod ingress;
pub mod pipeline;
