//! HTTP face of a document store
//!
//! Serves one [`DocumentStore`] as a replication peer. The routes mirror
//! what [`HttpRemote`](crate::replication::HttpRemote) calls: store info at
//! `/`, the change feed at `/_changes` and replicated writes at
//! `/_bulk_docs`.

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use warp::http::StatusCode;
use warp::reply::Response;
use warp::{Filter, Rejection, Reply};

use crate::replication::protocol::{
    BulkDocsRequest, BulkDocsResponse, ChangesParams, ErrorBody, BULK_DOCS_PATH, CHANGES_PATH,
};
use crate::storage::DocumentStore;

use super::ServerError;

/// Largest accepted `_bulk_docs` body
const MAX_BODY_BYTES: u64 = 16 * 1024 * 1024;

/// Largest page `_changes` hands out in one response
const MAX_CHANGES_LIMIT: usize = 1000;

fn with_store(
    store: Arc<DocumentStore>,
) -> impl Filter<Extract = (Arc<DocumentStore>,), Error = Infallible> + Clone {
    warp::any().map(move || Arc::clone(&store))
}

pub fn routes(
    store: Arc<DocumentStore>,
) -> impl Filter<Extract = (impl Reply,), Error = Infallible> + Clone {
    let info = warp::path::end()
        .and(warp::get())
        .and(with_store(store.clone()))
        .and_then(handle_info);

    let changes = warp::path(CHANGES_PATH)
        .and(warp::path::end())
        .and(warp::get())
        .and(warp::query::<ChangesParams>())
        .and(with_store(store.clone()))
        .and_then(handle_changes);

    let bulk_docs = warp::path(BULK_DOCS_PATH)
        .and(warp::path::end())
        .and(warp::post())
        .and(warp::body::content_length_limit(MAX_BODY_BYTES))
        .and(warp::body::json())
        .and(with_store(store))
        .and_then(handle_bulk_docs);

    info.or(changes)
        .or(bulk_docs)
        .recover(handle_rejection)
        .with(warp::log("chatzap::network::server"))
}

async fn handle_info(store: Arc<DocumentStore>) -> Result<Response, Rejection> {
    Ok(warp::reply::json(&store.info().await).into_response())
}

async fn handle_changes(
    params: ChangesParams,
    store: Arc<DocumentStore>,
) -> Result<Response, Rejection> {
    let limit = params.limit.min(MAX_CHANGES_LIMIT);
    let page = store.changes_since(params.since, limit).await;
    Ok(warp::reply::json(&page).into_response())
}

async fn handle_bulk_docs(
    request: BulkDocsRequest,
    store: Arc<DocumentStore>,
) -> Result<Response, Rejection> {
    if request.new_edits {
        return Ok(error_reply(
            StatusCode::BAD_REQUEST,
            "bad_request",
            "only new_edits=false is supported",
        ));
    }

    match store.apply_replicated(request.docs).await {
        Ok(results) => Ok(warp::reply::json(&BulkDocsResponse { results }).into_response()),
        Err(e) => {
            log::error!("Failed to apply replicated documents: {}", e);
            Ok(error_reply(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                &e.to_string(),
            ))
        }
    }
}

fn error_reply(status: StatusCode, error: &str, reason: &str) -> Response {
    let body = ErrorBody {
        error: error.to_string(),
        reason: reason.to_string(),
    };
    warp::reply::with_status(warp::reply::json(&body), status).into_response()
}

async fn handle_rejection(rejection: Rejection) -> Result<Response, Infallible> {
    let (status, error) = if rejection.is_not_found() {
        (StatusCode::NOT_FOUND, "not_found")
    } else if rejection.find::<warp::reject::MethodNotAllowed>().is_some() {
        (StatusCode::METHOD_NOT_ALLOWED, "method_not_allowed")
    } else if rejection.find::<warp::reject::PayloadTooLarge>().is_some() {
        (StatusCode::PAYLOAD_TOO_LARGE, "too_large")
    } else if rejection.find::<warp::reject::InvalidQuery>().is_some()
        || rejection.find::<warp::filters::body::BodyDeserializeError>().is_some()
    {
        (StatusCode::BAD_REQUEST, "bad_request")
    } else {
        log::warn!("Unhandled rejection: {:?}", rejection);
        (StatusCode::INTERNAL_SERVER_ERROR, "internal_error")
    };

    Ok(error_reply(status, error, &format!("{:?}", rejection)))
}

/// Bind `addr` and return the bound address and the server future. The
/// server runs until `shutdown` resolves.
pub fn bind_with_shutdown<S>(
    store: Arc<DocumentStore>,
    addr: SocketAddr,
    shutdown: S,
) -> Result<(SocketAddr, impl Future<Output = ()>), ServerError>
where
    S: Future<Output = ()> + Send + 'static,
{
    let (bound, server) = warp::serve(routes(store))
        .try_bind_with_graceful_shutdown(addr, shutdown)
        .map_err(|e| ServerError::Bind(format!("{}: {}", addr, e)))?;

    log::info!("Serving document store on http://{}", bound);
    Ok((bound, server))
}

/// Bind `addr` and serve until the returned future is dropped.
pub fn bind(
    store: Arc<DocumentStore>,
    addr: SocketAddr,
) -> Result<(SocketAddr, impl Future<Output = ()>), ServerError> {
    let (bound, server) = warp::serve(routes(store))
        .try_bind_ephemeral(addr)
        .map_err(|e| ServerError::Bind(format!("{}: {}", addr, e)))?;

    log::info!("Serving document store on http://{}", bound);
    Ok((bound, server))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{ApplyOutcome, ChangesPage, Doc, ReplicatedDoc, StoreInfo};
    use serde_json::json;

    async fn store_with_doc() -> Arc<DocumentStore> {
        let store = Arc::new(DocumentStore::in_memory());
        let doc = Doc::from_value(json!({"_id": "a", "type": "conversation"})).unwrap();
        store.put(doc).await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_info_route() {
        let store = store_with_doc().await;
        let response = warp::test::request()
            .method("GET")
            .path("/")
            .reply(&routes(store.clone()))
            .await;

        assert_eq!(response.status(), StatusCode::OK);
        let info: StoreInfo = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(info.instance_id, store.instance_id());
        assert_eq!(info.doc_count, 1);
    }

    #[tokio::test]
    async fn test_changes_route() {
        let store = store_with_doc().await;
        let response = warp::test::request()
            .method("GET")
            .path("/_changes?since=0&limit=10")
            .reply(&routes(store))
            .await;

        assert_eq!(response.status(), StatusCode::OK);
        let page: ChangesPage = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(page.results.len(), 1);
        assert_eq!(page.last_seq, 1);
    }

    #[tokio::test]
    async fn test_bulk_docs_route() {
        let source = store_with_doc().await;
        let target = Arc::new(DocumentStore::in_memory());
        let docs: Vec<ReplicatedDoc> = source
            .changes_since(0, 10)
            .await
            .results
            .into_iter()
            .map(Into::into)
            .collect();

        let response = warp::test::request()
            .method("POST")
            .path("/_bulk_docs")
            .json(&BulkDocsRequest {
                docs,
                new_edits: false,
            })
            .reply(&routes(target.clone()))
            .await;

        assert_eq!(response.status(), StatusCode::OK);
        let body: BulkDocsResponse = serde_json::from_slice(response.body()).unwrap();
        assert!(matches!(body.results[0], ApplyOutcome::Applied { .. }));
        assert_eq!(target.get("a").await.unwrap().rev, source.get("a").await.unwrap().rev);
    }

    #[tokio::test]
    async fn test_new_edits_true_rejected() {
        let store = Arc::new(DocumentStore::in_memory());
        let response = warp::test::request()
            .method("POST")
            .path("/_bulk_docs")
            .json(&json!({"docs": [], "new_edits": true}))
            .reply(&routes(store))
            .await;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unknown_path_is_json_404() {
        let store = Arc::new(DocumentStore::in_memory());
        let response = warp::test::request()
            .method("GET")
            .path("/nope")
            .reply(&routes(store))
            .await;

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body: ErrorBody = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(body.error, "not_found");
    }
}
