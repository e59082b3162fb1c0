//! Cloud-provider collaborators: instance metadata (IMDS), EC2, Auto
//! Scaling and SQS clients, each a thin wrapper so the monitors that use
//! them stay testable against a trait.

pub mod asg;
pub mod ec2;
pub mod metadata;
pub mod queue;

pub use asg::AsgClient;
pub use ec2::Ec2Client;
pub use metadata::MetadataClient;
pub use queue::QueueClient;
