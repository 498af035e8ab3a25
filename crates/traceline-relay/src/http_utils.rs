// Copyright 2025-Present Traceline, Inc. https://www.traceline.dev/
// SPDX-License-Identifier: Apache-2.0

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::HeaderMap;
use hyper::http::{self, StatusCode};
use hyper::Response;
use serde_json::json;
use tracing::{debug, error};

pub type HttpResponse = Response<Full<Bytes>>;

/// Does two things:
/// 1. Logs a message. Level depends upon the status code. 2xx is debug,
///    anything else is error.
/// 2. Creates a JSON response with the given message and status code.
pub fn log_and_create_http_response(
    message: &str,
    status: StatusCode,
) -> http::Result<HttpResponse> {
    if status.is_success() {
        debug!("{message}");
    } else {
        error!("{message}");
    }
    let body = json!({ "message": message }).to_string();
    Response::builder()
        .status(status)
        .body(Full::new(Bytes::from(body)))
}

/// Takes a request's header map, a max content length, and a prefix for any
/// error message. Verifies that the request has a content length, that it
/// parses, and that it is within bounds.
///
/// Returns None when the request is acceptable, otherwise the error
/// response to hand straight back.
pub fn verify_request_content_length(
    header_map: &HeaderMap,
    max_content_length: usize,
    error_message_prefix: &str,
) -> Option<http::Result<HttpResponse>> {
    // No exemption for chunked senders: without a declared length the body
    // cannot be bounded up front, so it is refused outright.
    let Some(content_length_header) = header_map.get(hyper::header::CONTENT_LENGTH) else {
        return Some(log_and_create_http_response(
            &format!("{error_message_prefix}: Missing Content-Length header"),
            StatusCode::LENGTH_REQUIRED,
        ));
    };

    let content_length = content_length_header
        .to_str()
        .ok()
        .and_then(|s| s.parse::<usize>().ok());
    let Some(content_length) = content_length else {
        return Some(log_and_create_http_response(
            &format!("{error_message_prefix}: Invalid Content-Length header"),
            StatusCode::BAD_REQUEST,
        ));
    };

    if content_length > max_content_length {
        return Some(log_and_create_http_response(
            &format!("{error_message_prefix}: Payload too large"),
            StatusCode::PAYLOAD_TOO_LARGE,
        ));
    }
    None
}

#[cfg(test)]
mod tests {
    use http_body_util::BodyExt;

    use super::*;

    async fn response_body(result: http::Result<HttpResponse>) -> (StatusCode, String) {
        let response = result.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_response_carries_json_message() {
        let (status, body) =
            response_body(log_and_create_http_response("Recorded tree", StatusCode::OK)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, r#"{"message":"Recorded tree"}"#);
    }

    #[tokio::test]
    async fn test_missing_content_length_is_length_required() {
        let headers = HeaderMap::new();
        let result = verify_request_content_length(&headers, 1024, "Error processing report")
            .expect("missing header must be rejected");
        let (status, body) = response_body(result).await;
        assert_eq!(status, StatusCode::LENGTH_REQUIRED);
        assert!(body.contains("Missing Content-Length header"));
    }

    #[tokio::test]
    async fn test_chunked_without_length_is_refused() {
        let mut headers = HeaderMap::new();
        headers.insert(
            hyper::header::TRANSFER_ENCODING,
            "chunked".parse().unwrap(),
        );
        let result = verify_request_content_length(&headers, 1024, "Error processing report")
            .expect("length-less chunked request must be rejected");
        let (status, _) = response_body(result).await;
        assert_eq!(status, StatusCode::LENGTH_REQUIRED);
    }

    #[tokio::test]
    async fn test_unparseable_content_length_is_bad_request() {
        let mut headers = HeaderMap::new();
        headers.insert(hyper::header::CONTENT_LENGTH, "banana".parse().unwrap());
        let result = verify_request_content_length(&headers, 1024, "Error processing report")
            .expect("junk header must be rejected");
        let (status, _) = response_body(result).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_over_limit_content_length_is_payload_too_large() {
        let mut headers = HeaderMap::new();
        headers.insert(hyper::header::CONTENT_LENGTH, "2048".parse().unwrap());
        let result = verify_request_content_length(&headers, 1024, "Error processing report")
            .expect("oversized body must be rejected");
        let (status, _) = response_body(result).await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn test_in_bounds_content_length_passes() {
        let mut headers = HeaderMap::new();
        headers.insert(hyper::header::CONTENT_LENGTH, "512".parse().unwrap());
        assert!(verify_request_content_length(&headers, 1024, "Error").is_none());
    }
}
