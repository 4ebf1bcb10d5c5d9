//! Outbound TCP with optional proxy traversal
//!
//! Proxy selection follows the usual environment variables
//! (`HTTPS_PROXY`, `HTTP_PROXY`, `ALL_PROXY`, `NO_PROXY`, upper or lower case)
//! unless the configuration names a proxy explicitly.

use super::SocketOpts;
use crate::error::TransportError;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;
use url::Url;

/// Proxy selection for outbound connections
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxySettings {
    /// Proxy to traverse
    pub proxy: Option<Url>,
    /// Hosts reached directly (`*` disables the proxy)
    pub no_proxy: Vec<String>,
}

impl ProxySettings {
    /// Use an explicit proxy, ignoring the environment
    pub fn explicit(proxy: Url) -> Self {
        ProxySettings {
            proxy: Some(proxy),
            no_proxy: Vec::new(),
        }
    }

    /// Read proxy settings from the process environment
    pub fn from_env(secure: bool) -> Self {
        Self::from_lookup(secure, |key| std::env::var(key).ok())
    }

    /// Read proxy settings through a variable lookup
    pub fn from_lookup<F>(secure: bool, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(name)
                .or_else(|| lookup(&name.to_lowercase()))
                .filter(|v| !v.trim().is_empty())
        };

        let candidates: &[&str] = if secure {
            &["HTTPS_PROXY", "ALL_PROXY"]
        } else {
            &["HTTP_PROXY", "ALL_PROXY"]
        };
        let proxy = candidates
            .iter()
            .find_map(|name| get(name))
            .and_then(|raw| parse_proxy_url(&raw));

        let no_proxy = get("NO_PROXY")
            .map(|raw| {
                raw.split(',')
                    .map(|h| h.trim().trim_start_matches('.').to_lowercase())
                    .filter(|h| !h.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        ProxySettings { proxy, no_proxy }
    }

    /// Proxy to use for `host`, if any
    pub fn proxy_for(&self, host: &str) -> Option<&Url> {
        let host = host.to_lowercase();
        let bypass = self.no_proxy.iter().any(|entry| {
            entry == "*" || host == *entry || host.ends_with(&format!(".{}", entry))
        });
        if bypass {
            None
        } else {
            self.proxy.as_ref()
        }
    }
}

/// Accept `host:port` shorthand as an HTTP proxy
fn parse_proxy_url(raw: &str) -> Option<Url> {
    Url::parse(raw)
        .ok()
        .filter(|u| u.host_str().is_some())
        .or_else(|| Url::parse(&format!("http://{}", raw)).ok())
}

/// Connect to `host:port`, through the selected proxy when one applies
pub async fn connect_tcp(
    host: &str,
    port: u16,
    proxy: &ProxySettings,
    opts: &SocketOpts,
    timeout: Duration,
) -> Result<TcpStream, TransportError> {
    let attempt = async {
        match proxy.proxy_for(host) {
            None => {
                let stream = TcpStream::connect((host, port)).await.map_err(|e| {
                    TransportError::ConnectFailed(format!("Failed to connect to {}:{}: {}", host, port, e))
                })?;
                debug!("TCP connection established to {}:{}", host, port);
                Ok(stream)
            }
            Some(url) => connect_via(url, host, port).await,
        }
    };

    let stream = tokio::time::timeout(timeout, attempt)
        .await
        .map_err(|_| TransportError::ConnectFailed(format!("Connection timeout to {}:{}", host, port)))??;

    opts.apply(&stream)?;
    Ok(stream)
}

async fn connect_via(proxy: &Url, host: &str, port: u16) -> Result<TcpStream, TransportError> {
    let proxy_host = proxy
        .host_str()
        .ok_or_else(|| TransportError::ConnectFailed(format!("Proxy URL has no host: {}", proxy)))?;
    let proxy_port = proxy.port_or_known_default().unwrap_or(match proxy.scheme() {
        "socks5" | "socks5h" => 1080,
        _ => 8080,
    });

    let mut stream = TcpStream::connect((proxy_host, proxy_port)).await.map_err(|e| {
        TransportError::ConnectFailed(format!(
            "Failed to connect to proxy {}:{}: {}",
            proxy_host, proxy_port, e
        ))
    })?;

    let username = proxy.username();
    let password = proxy.password().unwrap_or("");

    match proxy.scheme() {
        "http" | "https" => {
            let result = if username.is_empty() {
                async_http_proxy::http_connect_tokio(&mut stream, host, port).await
            } else {
                async_http_proxy::http_connect_tokio_with_basic_auth(
                    &mut stream,
                    host,
                    port,
                    username,
                    password,
                )
                .await
            };
            result.map_err(|e| {
                TransportError::ConnectFailed(format!("HTTP proxy CONNECT to {}:{} failed: {}", host, port, e))
            })?;
        }
        "socks5" | "socks5h" => {
            let auth = if username.is_empty() {
                None
            } else {
                Some(async_socks5::Auth {
                    username: username.to_string(),
                    password: password.to_string(),
                })
            };
            async_socks5::connect(&mut stream, (host.to_string(), port), auth)
                .await
                .map_err(|e| {
                    TransportError::ConnectFailed(format!(
                        "SOCKS5 proxy connect to {}:{} failed: {}",
                        host, port, e
                    ))
                })?;
        }
        other => {
            return Err(TransportError::ConnectFailed(format!(
                "Unsupported proxy scheme: {}",
                other
            )));
        }
    }

    debug!("Connected to {}:{} via proxy {}:{}", host, port, proxy_host, proxy_port);
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_env_selection() {
        let settings = ProxySettings::from_lookup(
            true,
            lookup(&[("https_proxy", "http://proxy.corp:3128"), ("HTTP_PROXY", "http://other:1")]),
        );
        assert_eq!(settings.proxy.unwrap().host_str(), Some("proxy.corp"));

        let settings = ProxySettings::from_lookup(false, lookup(&[("ALL_PROXY", "socks5://s:1080")]));
        assert_eq!(settings.proxy.unwrap().scheme(), "socks5");

        let settings = ProxySettings::from_lookup(true, lookup(&[]));
        assert!(settings.proxy.is_none());
    }

    #[test]
    fn test_shorthand_proxy() {
        let settings = ProxySettings::from_lookup(true, lookup(&[("HTTPS_PROXY", "proxy.corp:3128")]));
        let url = settings.proxy.unwrap();
        assert_eq!(url.scheme(), "http");
        assert_eq!(url.port(), Some(3128));
    }

    #[test]
    fn test_no_proxy() {
        let settings = ProxySettings::from_lookup(
            true,
            lookup(&[("HTTPS_PROXY", "http://p:3128"), ("NO_PROXY", "localhost, .internal.example")]),
        );
        assert!(settings.proxy_for("localhost").is_none());
        assert!(settings.proxy_for("api.internal.example").is_none());
        assert!(settings.proxy_for("internal.example").is_none());
        assert!(settings.proxy_for("appsync.amazonaws.com").is_some());

        let all = ProxySettings {
            proxy: settings.proxy.clone(),
            no_proxy: vec!["*".to_string()],
        };
        assert!(all.proxy_for("anything").is_none());
    }

    #[tokio::test]
    async fn test_connect_direct() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (mut s, _) = listener.accept().await.unwrap();
            s.write_all(b"hi").await.unwrap();
        });

        let mut stream = connect_tcp(
            "127.0.0.1",
            port,
            &ProxySettings::default(),
            &SocketOpts::default(),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        let mut buf = [0u8; 2];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_through_http_proxy() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_addr = listener.local_addr().unwrap();
        let proxy = tokio::spawn(async move {
            let (mut s, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            let mut read = 0;
            while !buf[..read].windows(4).any(|w| w == b"\r\n\r\n") {
                read += s.read(&mut buf[read..]).await.unwrap();
            }
            let request = String::from_utf8_lossy(&buf[..read]).to_string();
            s.write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
                .await
                .unwrap();
            request
        });

        let settings = ProxySettings::explicit(
            Url::parse(&format!("http://{}", proxy_addr)).unwrap(),
        );
        connect_tcp(
            "realtime.example",
            443,
            &settings,
            &SocketOpts::default(),
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        let request = proxy.await.unwrap();
        assert!(request.starts_with("CONNECT realtime.example:443"));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = connect_tcp(
            "127.0.0.1",
            port,
            &ProxySettings::default(),
            &SocketOpts::default(),
            Duration::from_secs(5),
        )
        .await
        .unwrap_err();
        assert!(err.is_retryable());
    }
}
