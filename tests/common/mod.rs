//! In-process fake blob store for integration tests: bind to an ephemeral
//! port, serve with `make_service_fn`/`service_fn`, and return the bound
//! address once the server is actually listening.

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use tyger_dataplane::http_engine::CHAIN_HEADER;
use url::Url;

#[derive(Clone)]
struct StoredBlob {
    body: Vec<u8>,
    content_md5: String,
    chain_header: Option<String>,
}

/// An in-memory stand-in for the blob store, keyed by request path. Good
/// enough to exercise the HEAD-probe/PUT/GET contract `http_engine`
/// actually speaks, without a real storage account.
#[derive(Clone, Default)]
pub struct FakeStore {
    state: Arc<Mutex<HashMap<String, StoredBlob>>>,
}

impl FakeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts the server on an ephemeral localhost port and returns a
    /// container URL under it. Every test gets its own store and its own
    /// port, so containers never collide.
    pub async fn spawn(self) -> Url {
        let addr: SocketAddr = ([127, 0, 0, 1], 0).into();
        let make_svc = make_service_fn(move |_conn| {
            let store = self.clone();
            async move { Ok::<_, Infallible>(service_fn(move |req| handle(req, store.clone()))) }
        });
        let server = Server::bind(&addr).serve(make_svc);
        let bound_addr = server.local_addr();
        tokio::spawn(async move {
            let _ = server.await;
        });
        Url::parse(&format!("http://{bound_addr}/buffer")).unwrap()
    }

    /// Overwrites a stored block's chain header, simulating corruption in
    /// transit or at rest.
    pub fn corrupt_chain_header(&self, path: &str, new_value: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(blob) = state.get_mut(path) {
            blob.chain_header = Some(new_value.to_owned());
        }
    }

    /// Overwrites a stored block's body without touching its recorded
    /// `Content-MD5`, simulating payload corruption at rest.
    pub fn corrupt_body(&self, path: &str, new_body: Vec<u8>) {
        let mut state = self.state.lock().unwrap();
        if let Some(blob) = state.get_mut(path) {
            blob.body = new_body;
        }
    }
}

async fn handle(req: Request<Body>, store: FakeStore) -> Result<Response<Body>, Infallible> {
    let path = req.uri().path().to_owned();
    match *req.method() {
        Method::HEAD => {
            let state = store.state.lock().unwrap();
            Ok(match state.get(&path) {
                Some(blob) => head_response(blob),
                None => not_found(),
            })
        }
        Method::GET => {
            let state = store.state.lock().unwrap();
            Ok(match state.get(&path) {
                Some(blob) => get_response(blob),
                None => not_found(),
            })
        }
        Method::PUT => {
            let content_md5 = req
                .headers()
                .get("Content-MD5")
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_owned();
            let chain_header = req.headers().get(CHAIN_HEADER).and_then(|v| v.to_str().ok()).map(str::to_owned);
            let body = hyper::body::to_bytes(req.into_body()).await.unwrap_or_default().to_vec();
            store.state.lock().unwrap().insert(
                path,
                StoredBlob {
                    body,
                    content_md5,
                    chain_header,
                },
            );
            Ok(Response::builder().status(StatusCode::CREATED).body(Body::empty()).unwrap())
        }
        _ => Ok(Response::builder().status(StatusCode::METHOD_NOT_ALLOWED).body(Body::empty()).unwrap()),
    }
}

fn head_response(blob: &StoredBlob) -> Response<Body> {
    let mut builder = Response::builder().status(StatusCode::OK).header("Content-MD5", &blob.content_md5);
    if let Some(chain) = &blob.chain_header {
        builder = builder.header(CHAIN_HEADER, chain);
    }
    builder.body(Body::empty()).unwrap()
}

fn get_response(blob: &StoredBlob) -> Response<Body> {
    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header("Content-Length", blob.body.len())
        .header("Content-MD5", &blob.content_md5);
    if let Some(chain) = &blob.chain_header {
        builder = builder.header(CHAIN_HEADER, chain);
    }
    builder.body(Body::from(blob.body.clone())).unwrap()
}

fn not_found() -> Response<Body> {
    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .header("x-ms-error-code", "BlobNotFound")
        .body(Body::empty())
        .unwrap()
}
