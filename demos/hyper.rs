//
//  Sample application.
//
//  Listens on localhost:4918, plain http, no ssl, and serves an
//  in-memory filesystem. Locks are kept in memory, in a directory
//  (-s file -d /some/dir) or in an in-process key-value cache (-s cache).
//
use std::convert::Infallible;
use std::error::Error;
use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use headers::{Authorization, HeaderMapExt, authorization::Basic};
use hyper::server::conn::http1;
use hyper_util::rt::TokioIo;

use dav_lockd::{
    DavConfig, DavHandler, DavLockManager, LockManagerConfig,
    body::Body,
    cachels::MemCache,
    ls::{LockStorageKind, LsConfig},
    memfs::MemFs,
};

#[derive(Clone)]
struct Server {
    dh: DavHandler,
    auth: bool,
}

impl Server {
    async fn handle(
        &self,
        req: hyper::Request<hyper::body::Incoming>,
    ) -> Result<hyper::Response<Body>, Infallible> {
        let user = if self.auth {
            // the principal is the user name, the password is not checked.
            match req.headers().typed_get::<Authorization<Basic>>() {
                Some(Authorization(basic)) => Some(basic.username().to_string()),
                None => {
                    let response = hyper::Response::builder()
                        .status(401)
                        .header("WWW-Authenticate", "Basic realm=\"dav-lockd\"")
                        .body(Body::from("please auth"))
                        .unwrap();
                    return Ok(response);
                }
            }
        } else {
            None
        };

        if let Some(user) = user {
            let config = DavConfig::new().principal(user);
            Ok(self.dh.handle_with(config, req).await)
        } else {
            Ok(self.dh.handle(req).await)
        }
    }
}

#[derive(Debug, clap::Parser)]
#[clap(about, version)]
struct Cli {
    /// port to listen on
    #[clap(short = 'p', long, default_value = "4918")]
    port: u16,
    /// lock storage: memory, file or cache
    #[clap(short = 's', long, default_value = "memory")]
    storage: LockStorageKind,
    /// directory for the file lock storage
    #[clap(short = 'd', long)]
    dir: Option<PathBuf>,
    /// lock manager configuration (JSON)
    #[clap(short = 'c', long)]
    config: Option<PathBuf>,
    /// require basic authentication, the user name becomes the lock principal
    #[clap(short = 'a', long)]
    auth: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let args = Cli::parse();

    let lm_config = match args.config {
        Some(ref path) => serde_json::from_slice::<LockManagerConfig>(&std::fs::read(path)?)?,
        None => LockManagerConfig::default(),
    };
    let ls_config = LsConfig {
        kind: args.storage,
        path: args.dir.clone(),
        cache_prefix: None,
    };
    let cache = match args.storage {
        LockStorageKind::Cache => Some(MemCache::new() as Box<dyn dav_lockd::cachels::KeyValueCache>),
        _ => None,
    };
    let storage = ls_config.build(cache)?;
    log::info!("lock storage: {:?}", storage);

    let dh = DavHandler::builder()
        .filesystem(MemFs::new())
        .lockmanager(DavLockManager::with_config(storage, lm_config))
        .build_handler();
    let server = Server { dh, auth: args.auth };

    let addr: SocketAddr = ([127, 0, 0, 1], args.port).into();
    let listener = tokio::net::TcpListener::bind(addr).await?;
    println!("dav-lockd: listening on {:?} ({:?} lock storage)", addr, args.storage);

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let server = server.clone();
        tokio::task::spawn(async move {
            let service = hyper::service::service_fn(move |req| {
                let server = server.clone();
                async move { server.handle(req).await }
            });
            if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                eprintln!("Failed serving: {:?}", err);
            }
        });
    }
}
