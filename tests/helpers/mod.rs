#![allow(dead_code)]
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;

use dotfwd::frame::{read_frame, write_frame};
use dotfwd::session::SessionTimeouts;
use dotfwd::stats::Stats;
use dotfwd::transport::{LinkPolicy, UpstreamConfig, Verification};
use dotfwd::{Frame, Proxy, ProxyConfig};

/// How the fake resolver answers.
#[derive(Debug, Clone, Copy)]
pub enum Behavior {
    /// Send every frame straight back.
    Echo,
    /// Send every frame back after a delay.
    EchoAfter(Duration),
    /// Read queries, never answer.
    Silent,
    /// Answer one query, then close the link.
    CloseAfterAnswer,
    /// Answer under a different transaction ID.
    WrongId,
    /// Answer with a length prefix of 1.
    Malformed,
}

/// DNS-over-TLS resolver on 127.0.0.1 with a self-signed certificate for
/// `localhost`.
pub struct FakeUpstream {
    addr: SocketAddr,
    cert: CertificateDer<'static>,
    accepted: Arc<AtomicUsize>,
    seen_ids: Arc<Mutex<Vec<u16>>>,
    task: JoinHandle<()>,
}

impl FakeUpstream {
    pub async fn start(behavior: Behavior) -> Self {
        let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let cert = certified.cert.der().clone();
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der()));

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let server_config = rustls::ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_no_client_auth()
            .with_single_cert(vec![cert.clone()], key)
            .unwrap();
        let acceptor = TlsAcceptor::from(Arc::new(server_config));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let seen_ids = Arc::new(Mutex::new(Vec::new()));

        let task = tokio::spawn({
            let accepted = accepted.clone();
            let seen_ids = seen_ids.clone();
            async move {
                loop {
                    let Ok((stream, _)) = listener.accept().await else {
                        continue;
                    };
                    let acceptor = acceptor.clone();
                    let accepted = accepted.clone();
                    let seen_ids = seen_ids.clone();
                    tokio::spawn(async move {
                        let Ok(tls) = acceptor.accept(stream).await else {
                            return;
                        };
                        accepted.fetch_add(1, Ordering::SeqCst);
                        serve(tls, behavior, seen_ids).await;
                    });
                }
            }
        });

        Self {
            addr,
            cert,
            accepted,
            seen_ids,
            task,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Upstream settings that trust this resolver's certificate.
    pub fn upstream_config(&self) -> UpstreamConfig {
        UpstreamConfig {
            host: "127.0.0.1".to_string(),
            port: self.addr.port(),
            tls_name: Some("localhost".to_string()),
            verification: Verification::WebPki {
                extra_roots: vec![self.cert.clone()],
            },
            connect_timeout: Duration::from_secs(2),
            ..Default::default()
        }
    }

    /// TLS sessions completed so far.
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    /// Transaction IDs of all queries received, in arrival order.
    pub fn seen_ids(&self) -> Vec<u16> {
        self.seen_ids.lock().unwrap().clone()
    }
}

impl Drop for FakeUpstream {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(
    mut tls: tokio_rustls::server::TlsStream<TcpStream>,
    behavior: Behavior,
    seen_ids: Arc<Mutex<Vec<u16>>>,
) {
    while let Ok(Some(query)) = read_frame(&mut tls).await {
        seen_ids.lock().unwrap().push(query.id);

        match behavior {
            Behavior::Echo => {
                if write_frame(&mut tls, &query).await.is_err() {
                    return;
                }
            }
            Behavior::EchoAfter(delay) => {
                tokio::time::sleep(delay).await;
                if write_frame(&mut tls, &query).await.is_err() {
                    return;
                }
            }
            Behavior::Silent => {
                tokio::time::sleep(Duration::from_secs(60)).await;
                return;
            }
            Behavior::CloseAfterAnswer => {
                let _ = write_frame(&mut tls, &query).await;
                let _ = tls.shutdown().await;
                return;
            }
            Behavior::WrongId => {
                let reply = query.with_id(0xdead);
                if write_frame(&mut tls, &reply).await.is_err() {
                    return;
                }
            }
            Behavior::Malformed => {
                let _ = tls.write_all(&[0x00, 0x01, 0x00]).await;
                let _ = tls.flush().await;
            }
        }
    }
}

pub fn proxy_config(upstream: UpstreamConfig) -> ProxyConfig {
    ProxyConfig {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        upstream,
        timeouts: SessionTimeouts {
            idle: Duration::from_secs(2),
            request: Duration::from_secs(2),
        },
        link_policy: LinkPolicy::PerSession,
        stats_interval: None,
    }
}

pub struct RunningProxy {
    pub addr: SocketAddr,
    pub stats: Arc<Stats>,
    task: JoinHandle<()>,
}

impl Drop for RunningProxy {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub async fn start_proxy(config: ProxyConfig) -> RunningProxy {
    let proxy = Proxy::bind(config).await.unwrap();
    let addr = proxy.local_addr().unwrap();
    let stats = proxy.stats();
    let task = proxy.spawn();

    RunningProxy { addr, stats, task }
}

/// Send one frame and wait for the next frame back.
pub async fn ask(stream: &mut TcpStream, query: &Frame) -> Option<Frame> {
    write_frame(stream, query).await.unwrap();
    read_frame(stream).await.ok().flatten()
}

/// Whether the peer closed the connection without sending anything more.
pub async fn is_closed(stream: &mut TcpStream) -> bool {
    !matches!(read_frame(stream).await, Ok(Some(_)))
}

/// Poll `condition` until it holds or `limit` passes.
pub async fn wait_until(limit: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
