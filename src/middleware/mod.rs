pub mod auth;
pub mod cache;
pub mod cookies;
pub mod dedup;
pub mod progress;
pub mod redirect;
pub mod retry;

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;

use crate::error::ClientError;
use crate::request::Request;
use crate::response::Response;
use crate::scheduler::Scheduler;

/// One layer of the onion around the transport. A middleware may transform
/// the request before `next.run(...)`, synthesize a response instead of
/// calling it (cache hit, dedup join), or transform the response after it
/// returns, but must not consume the body without substituting an
/// equivalent one.
#[async_trait]
pub trait Middleware: Send + Sync {
    async fn handle(&self, req: Request, next: Next) -> Result<Response, ClientError>;
}

/// The remainder of the pipeline from a middleware's position inward,
/// terminating at the scheduler (which wraps the transport). Owned and
/// cloneable so a stage can re-run its suffix: retry replays it per attempt,
/// dedup leaders and stale-while-revalidate refreshes run it from a spawned
/// task, auth re-enters it once after a 401.
#[derive(Clone)]
pub struct Next {
    chain: Arc<[Arc<dyn Middleware>]>,
    index: usize,
    terminal: Arc<Scheduler>,
}

impl Next {
    pub(crate) fn new(chain: Arc<[Arc<dyn Middleware>]>, terminal: Arc<Scheduler>) -> Self {
        Self {
            chain,
            index: 0,
            terminal,
        }
    }

    /// Run the rest of the pipeline. Boxed and `'static` so suffixes can be
    /// spawned; recursion happens through the box.
    pub fn run(self, req: Request) -> BoxFuture<'static, Result<Response, ClientError>> {
        Box::pin(async move {
            match self.chain.get(self.index) {
                Some(mw) => {
                    let mw = mw.clone();
                    let next = Next {
                        chain: self.chain,
                        index: self.index + 1,
                        terminal: self.terminal,
                    };
                    mw.handle(req, next).await
                }
                None => self.terminal.execute(req).await,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConcurrencyConfig;
    use crate::response::Response;
    use crate::scheduler::Scheduler;
    use crate::transport::Transport;
    use bytes::Bytes;
    use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use url::Url;

    struct EchoTransport;

    #[async_trait]
    impl Transport for EchoTransport {
        async fn dispatch(&self, req: Request) -> Result<Response, ClientError> {
            // Echo request headers back so tests can observe ordering.
            let mut headers = HeaderMap::new();
            for (name, value) in req.headers().iter() {
                headers.append(name.clone(), value.clone());
            }
            Ok(Response::from_bytes(
                StatusCode::OK,
                headers,
                req.url().clone(),
                Bytes::new(),
            ))
        }
    }

    struct Tagger {
        tag: &'static str,
        order: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Middleware for Tagger {
        async fn handle(&self, req: Request, next: Next) -> Result<Response, ClientError> {
            let seq = self.order.fetch_add(1, Ordering::SeqCst);
            let req = req.with_header(
                HeaderName::try_from(format!("x-seen-{}", self.tag)).unwrap(),
                HeaderValue::from_str(&seq.to_string()).unwrap(),
            );
            next.run(req).await
        }
    }

    fn terminal() -> Arc<Scheduler> {
        Arc::new(Scheduler::new(
            &ConcurrencyConfig::default(),
            Arc::new(EchoTransport),
        ))
    }

    #[tokio::test]
    async fn test_registration_order_is_outer_to_inner() {
        let order = Arc::new(AtomicUsize::new(0));
        let chain: Arc<[Arc<dyn Middleware>]> = Arc::from(vec![
            Arc::new(Tagger {
                tag: "outer",
                order: order.clone(),
            }) as Arc<dyn Middleware>,
            Arc::new(Tagger {
                tag: "inner",
                order: order.clone(),
            }) as Arc<dyn Middleware>,
        ]);
        let next = Next::new(chain, terminal());
        let req = Request::get(Url::parse("https://h.test/x").unwrap());
        let resp = next.run(req).await.unwrap();

        assert_eq!(resp.headers().get("x-seen-outer").unwrap(), "0");
        assert_eq!(resp.headers().get("x-seen-inner").unwrap(), "1");
    }

    #[tokio::test]
    async fn test_empty_chain_reaches_transport() {
        let chain: Arc<[Arc<dyn Middleware>]> = Arc::from(Vec::new());
        let next = Next::new(chain, terminal());
        let req = Request::get(Url::parse("https://h.test/x").unwrap());
        let resp = next.run(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
