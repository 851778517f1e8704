use std::net::{Ipv6Addr, SocketAddr};
use std::sync::Arc;

use anyhow::Result;
use quinn::VarInt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::common::error::Error;
use crate::common::{tls, Address};
use crate::config::HgConfig;
use crate::proxy::outbound::tuic::{
    auth_token, TuicStream, AUTH_TIMEOUT, AUTH_TOKEN_SIZE, AUTH_UUID, CMD_AUTHENTICATE,
    CMD_CONNECT, CMD_HEARTBEAT, ERR_CODE_AUTH_TIMEOUT, ERR_CODE_STREAM, MAX_IDLE_TIMEOUT,
    QUIC_ALPN, TUIC_ADDR_TYPES, TUIC_VERSION,
};
use crate::router::Router;

/// TUIC 服务端: 每条 QUIC 连接并行处理 uni 流（认证）、bi 流（连接请求）
/// 与数据报（心跳）；连接建立后 7 秒内未完成认证即关闭。
pub async fn serve(hg: &HgConfig, router: Arc<Router>, token: CancellationToken) -> Result<()> {
    let quic_port = hg
        .quic_port
        .ok_or_else(|| Error::BadConfig("TUIC server needs 'quic-port'".into()))?;
    let pair = hg
        .tls_cert_key_pair
        .as_ref()
        .ok_or_else(|| Error::BadConfig("TUIC server needs 'tls-cert-key-pair'".into()))?;
    let mut tls_config = tls::server_config(&pair.cert_file, &pair.key_file)?
        .as_ref()
        .clone();
    tls_config.alpn_protocols = vec![QUIC_ALPN.to_vec()];

    let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(
        quinn::crypto::rustls::QuicServerConfig::try_from(tls_config)?,
    ));
    let mut transport = quinn::TransportConfig::default();
    transport.max_idle_timeout(Some(quinn::IdleTimeout::try_from(MAX_IDLE_TIMEOUT)?));
    transport.max_concurrent_bidi_streams(VarInt::from_u32(1 << 20));
    transport.max_concurrent_uni_streams(VarInt::from_u32(1 << 20));
    server_config.transport_config(Arc::new(transport));

    let listen = SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), quic_port);
    let endpoint = quinn::Endpoint::server(server_config, listen)?;
    info!(addr = %listen, "QUIC carrier listening");

    let password_hex: Arc<str> = hg.password.hex.clone().into();
    loop {
        let incoming = tokio::select! {
            _ = token.cancelled() => {
                endpoint.close(VarInt::from_u32(0), b"shutting down");
                return Ok(());
            }
            incoming = endpoint.accept() => match incoming {
                Some(incoming) => incoming,
                None => return Ok(()),
            },
        };

        let router = router.clone();
        let password_hex = password_hex.clone();
        let token = token.clone();
        tokio::spawn(async move {
            let conn = match incoming.await {
                Ok(conn) => conn,
                Err(e) => {
                    info!(error = %e, "fail to accept a QUIC connection");
                    return;
                }
            };
            tokio::select! {
                _ = token.cancelled() => {
                    conn.close(VarInt::from_u32(0), b"shutting down");
                }
                _ = handle_connection(conn.clone(), router, password_hex) => {}
            }
        });
    }
}

async fn handle_connection(conn: quinn::Connection, router: Arc<Router>, password_hex: Arc<str>) {
    let (auth_tx, auth_rx) = watch::channel(false);

    // auth deadline watcher
    {
        let conn = conn.clone();
        let auth_rx = auth_rx.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = wait_authenticated(auth_rx) => {}
                _ = conn.closed() => {}
                _ = tokio::time::sleep(AUTH_TIMEOUT) => {
                    conn.close(
                        VarInt::from_u32(ERR_CODE_AUTH_TIMEOUT),
                        b"fail to receive authentication command in time",
                    );
                }
            }
        });
    }

    // unidirectional streams carry the authentication command
    {
        let conn = conn.clone();
        let password_hex = password_hex.clone();
        tokio::spawn(async move {
            loop {
                let stream = match conn.accept_uni().await {
                    Ok(stream) => stream,
                    Err(_) => return,
                };
                let conn = conn.clone();
                let password_hex = password_hex.clone();
                let auth_tx = auth_tx.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_uni_stream(stream, &conn, &password_hex, &auth_tx).await
                    {
                        info!(error = %e, "fail to handle a QUIC unidirectional stream");
                        conn.close(
                            VarInt::from_u32(ERR_CODE_STREAM),
                            b"fail to handle unidirectional command",
                        );
                    }
                });
            }
        });
    }

    // heartbeats arrive as datagrams and are discarded after validation
    {
        let conn = conn.clone();
        tokio::spawn(async move {
            loop {
                let datagram = match conn.read_datagram().await {
                    Ok(datagram) => datagram,
                    Err(_) => return,
                };
                if datagram.len() < 2
                    || datagram[0] != TUIC_VERSION
                    || datagram[1] != CMD_HEARTBEAT
                {
                    conn.close(VarInt::from_u32(ERR_CODE_STREAM), b"unknown datagram");
                    return;
                }
            }
        });
    }

    // bidirectional streams carry connect requests
    loop {
        let (send, recv) = match conn.accept_bi().await {
            Ok(pair) => pair,
            Err(_) => return,
        };
        let conn = conn.clone();
        let router = router.clone();
        let auth_rx = auth_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_bi_stream(send, recv, &conn, &router, auth_rx).await {
                info!(error = %e, "fail to handle a QUIC stream");
                conn.close(VarInt::from_u32(ERR_CODE_STREAM), b"fail to handle stream");
            }
        });
    }
}

async fn handle_uni_stream(
    mut stream: quinn::RecvStream,
    conn: &quinn::Connection,
    password_hex: &str,
    auth_tx: &watch::Sender<bool>,
) -> Result<()> {
    let mut head = [0u8; 2];
    stream
        .read_exact(&mut head)
        .await
        .map_err(|e| Error::ProtocolViolation(e.to_string()))?;
    validate_version(head[0])?;
    match head[1] {
        CMD_AUTHENTICATE => {
            if *auth_tx.borrow() {
                return Err(Error::ProtocolViolation("already authenticated".into()).into());
            }
            let mut data = [0u8; 16 + AUTH_TOKEN_SIZE];
            stream
                .read_exact(&mut data)
                .await
                .map_err(|e| Error::ProtocolViolation(e.to_string()))?;
            if data[..16] != *AUTH_UUID {
                return Err(Error::AuthFailure(
                    "incorrect UUID in request authenticate command".into(),
                )
                .into());
            }
            let expected = auth_token(conn, password_hex)?;
            if data[16..] != expected {
                return Err(Error::AuthFailure(
                    "incorrect token in request authenticate command".into(),
                )
                .into());
            }
            let _ = auth_tx.send(true);
            debug!("TUIC client authenticated");
            Ok(())
        }
        other => {
            Err(Error::ProtocolViolation(format!("unknown command type {}", other)).into())
        }
    }
}

async fn handle_bi_stream(
    send: quinn::SendStream,
    mut recv: quinn::RecvStream,
    conn: &quinn::Connection,
    router: &Router,
    auth_rx: watch::Receiver<bool>,
) -> Result<()> {
    let mut head = [0u8; 2];
    recv.read_exact(&mut head)
        .await
        .map_err(|e| Error::ProtocolViolation(e.to_string()))?;
    validate_version(head[0])?;
    if head[1] != CMD_CONNECT {
        return Err(
            Error::ProtocolViolation(format!("unknown command type {}", head[1])).into(),
        );
    }
    let dest = Address::read_from(&mut recv, TUIC_ADDR_TYPES).await?;

    // requests may arrive before the auth uni-stream is processed
    tokio::select! {
        _ = wait_authenticated(auth_rx) => {}
        _ = conn.closed() => return Ok(()),
    }

    debug!(target = %dest, "TUIC connect request accepted");
    let stream = TuicStream::new_server(send, recv);
    crate::proxy::forward_tcp(router, &dest, Box::new(stream)).await
}

async fn wait_authenticated(mut auth_rx: watch::Receiver<bool>) {
    loop {
        if *auth_rx.borrow_and_update() {
            return;
        }
        if auth_rx.changed().await.is_err() {
            // sender gone without authenticating: wait for the connection
            // close to cancel us
            std::future::pending::<()>().await;
        }
    }
}

fn validate_version(version: u8) -> Result<()> {
    if version != TUIC_VERSION {
        return Err(Error::ProtocolViolation(format!(
            "expected version {} in the client command, but got {}",
            TUIC_VERSION, version
        ))
        .into());
    }
    Ok(())
}
