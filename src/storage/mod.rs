//! Image storage module
//!
//! Handles:
//! - Image upload/delete (local directory or S3-compatible bucket)
//! - Public URL generation

mod images;

pub use images::{ImageStorage, blob_name};

pub(crate) fn build_s3_http_client() -> aws_sdk_s3::config::SharedHttpClient {
    use aws_smithy_runtime::client::http::hyper_014::HyperClientBuilder;

    let https_connector = hyper_rustls::HttpsConnectorBuilder::new()
        .with_webpki_roots()
        .https_or_http()
        .enable_http1()
        .enable_http2()
        .build();

    HyperClientBuilder::new().build(https_connector)
}
