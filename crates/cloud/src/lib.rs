//! Cloud object storage for generated images.
//!
//! [`store::ObjectStore`] is the seam the invocation flow uploads
//! through; [`s3::S3Store`] implements it on top of `aws-sdk-s3`.

pub mod s3;
pub mod store;
