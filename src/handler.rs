//! Request handlers a site or route can delegate to

use crate::error::ResponseError;
use crate::files::FileServer;
use crate::proxy::ReverseProxy;
use crate::request::Request;
use crate::response::ResponseWriter;
use crate::router::Router;
use crate::status::Status;
use std::future::Future;
use std::pin::Pin;

/// Owned future returned by `Handler::serve`
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Everything that can answer a request
///
/// Handlers turn every domain failure into a status line. The only errors they
/// return are writer errors: a broken response contract or a dead peer.
pub enum Handler {
    Files(FileServer),
    Proxy(ReverseProxy),
    Router(Router),
    NotFound,
}

impl Handler {
    pub fn serve<'a>(
        &'a self,
        req: &'a mut Request,
        w: &'a mut ResponseWriter,
    ) -> BoxFuture<'a, Result<(), ResponseError>> {
        // Boxed because routers nest handlers recursively.
        Box::pin(async move {
            match self {
                Handler::Files(files) => files.serve(req, w).await,
                Handler::Proxy(proxy) => proxy.serve(req, w).await,
                Handler::Router(router) => router.serve(req, w).await,
                Handler::NotFound => {
                    w.status(Status::NOT_FOUND, &format!("{} not found", req.path()))
                        .await
                }
            }
        })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Handler::Files(_) => "files",
            Handler::Proxy(_) => "reverse_proxy",
            Handler::Router(_) => "routes",
            Handler::NotFound => "not_found",
        }
    }
}

impl std::fmt::Debug for Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Handler::Files(files) => f.debug_tuple("Files").field(&files.root()).finish(),
            Handler::Proxy(proxy) => f.debug_tuple("Proxy").field(&proxy.domain()).finish(),
            Handler::Router(router) => f.debug_tuple("Router").field(&router.patterns()).finish(),
            Handler::NotFound => f.write_str("NotFound"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_not_found_names_path() {
        let (mut client, server) = tokio::io::duplex(1024);
        let mut w = ResponseWriter::new(server);
        let mut req = Request::parse("gemini://a.example/missing.gmi").unwrap();

        Handler::NotFound.serve(&mut req, &mut w).await.unwrap();
        w.finish().await.unwrap();
        drop(w);

        let mut out = String::new();
        client.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "51 /missing.gmi not found\r\n");
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(Handler::NotFound.kind(), "not_found");
        assert_eq!(Handler::Router(Router::new()).kind(), "routes");
        assert_eq!(Handler::Files(FileServer::new("/srv")).kind(), "files");
    }
}
