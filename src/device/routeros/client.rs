//! RouterOS API session and connector.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use zeroize::Zeroizing;

use super::codec::{read_sentence, write_sentence};
use crate::device::{Credentials, DeviceConnector, DeviceError, DeviceSession, Record};

/// Plain-text API port.
pub const DEFAULT_PORT: u16 = 8728;

/// Default deadline for one command round-trip.
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(30);

/// Opens RouterOS API sessions over TCP.
#[derive(Debug, Clone)]
pub struct RouterOsConnector {
    default_port: u16,
    io_timeout: Duration,
    exclusive: bool,
}

impl Default for RouterOsConnector {
    fn default() -> Self {
        Self {
            default_port: DEFAULT_PORT,
            io_timeout: DEFAULT_IO_TIMEOUT,
            exclusive: false,
        }
    }
}

impl RouterOsConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Port used when a device address carries none.
    pub fn with_default_port(mut self, port: u16) -> Self {
        self.default_port = port;
        self
    }

    /// Deadline for each command round-trip, login included.
    pub fn with_io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = timeout;
        self
    }

    /// Allow at most one live session per device.
    pub fn with_exclusive_sessions(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }
}

/// Resolve a registry address to `host:port`.
///
/// Accepts `host`, `host:port`, bare IPv4/IPv6 and `[v6]:port`.
pub fn resolve_address(address: &str, default_port: u16) -> String {
    if address.parse::<SocketAddr>().is_ok() {
        return address.to_string();
    }
    if let Ok(ip) = address.parse::<IpAddr>() {
        return SocketAddr::new(ip, default_port).to_string();
    }
    if let Some((host, port)) = address.rsplit_once(':')
        && !host.contains(':')
        && port.parse::<u16>().is_ok()
    {
        return address.to_string();
    }
    format!("{address}:{default_port}")
}

#[async_trait]
impl DeviceConnector for RouterOsConnector {
    fn transport(&self) -> &str {
        "routeros-api"
    }

    fn exclusive_sessions(&self) -> bool {
        self.exclusive
    }

    async fn connect(&self, credentials: &Credentials) -> Result<Box<dyn DeviceSession>, DeviceError> {
        let target = resolve_address(&credentials.address, self.default_port);
        let stream = TcpStream::connect(&target).await?;
        stream.set_nodelay(true)?;

        let session = RouterOsSession::login(
            stream,
            &credentials.username,
            &credentials.password,
            self.io_timeout,
        )
        .await?;
        tracing::debug!(target = %target, "RouterOS API login succeeded");
        Ok(Box::new(session))
    }
}

/// Authenticated RouterOS API session over any byte stream.
pub struct RouterOsSession<S> {
    stream: S,
    io_timeout: Duration,
}

impl<S> std::fmt::Debug for RouterOsSession<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouterOsSession")
            .field("io_timeout", &self.io_timeout)
            .finish_non_exhaustive()
    }
}

/// Collected reply to one command.
enum Reply {
    Done(Vec<Record>, Vec<String>),
    Trap(String),
}

impl<S> RouterOsSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Log in with `/login =name= =password=`.
    pub async fn login(
        stream: S,
        username: &str,
        password: &str,
        io_timeout: Duration,
    ) -> Result<Self, DeviceError> {
        let mut session = Self { stream, io_timeout };
        let words = Zeroizing::new(vec![
            "/login".to_string(),
            format!("=name={username}"),
            format!("=password={password}"),
        ]);

        let reply = session.exchange(&words).await?;
        match reply {
            Reply::Trap(message) => Err(DeviceError::Auth(message)),
            Reply::Done(_, done) if done.iter().any(|w| w.starts_with("=ret=")) => Err(
                DeviceError::Auth("device requires challenge login, which is not supported".into()),
            ),
            Reply::Done(..) => Ok(session),
        }
    }

    async fn exchange(&mut self, words: &[String]) -> Result<Reply, DeviceError> {
        tokio::time::timeout(self.io_timeout, async {
            write_sentence(&mut self.stream, words).await?;
            self.read_reply().await
        })
        .await
        .map_err(|_| DeviceError::Timeout)?
    }

    async fn read_reply(&mut self) -> Result<Reply, DeviceError> {
        let mut records = Vec::new();
        let mut trap = None;

        loop {
            let sentence = read_sentence(&mut self.stream).await?;
            let Some((reply, attrs)) = sentence.split_first() else {
                continue;
            };
            match reply.as_str() {
                "!re" => records.push(parse_attributes(attrs)),
                "!trap" => {
                    let attrs = parse_attributes(attrs);
                    let message = attrs
                        .get("message")
                        .and_then(|m| m.as_str())
                        .unwrap_or("unknown error")
                        .to_string();
                    if trap.is_none() {
                        trap = Some(message);
                    }
                }
                "!empty" => {}
                "!done" => {
                    return Ok(match trap {
                        Some(message) => Reply::Trap(message),
                        None => Reply::Done(records, attrs.to_vec()),
                    });
                }
                "!fatal" => return Err(DeviceError::Fatal(attrs.join(" "))),
                other => {
                    return Err(DeviceError::Protocol(format!("unexpected reply word '{other}'")));
                }
            }
        }
    }
}

/// Turn `=key=value` words into a record. API words such as `.tag=` are skipped.
fn parse_attributes(words: &[String]) -> Record {
    words
        .iter()
        .filter_map(|word| word.strip_prefix('='))
        .map(|attr| match attr.split_once('=') {
            Some((key, value)) => (key.to_string(), serde_json::Value::from(value)),
            None => (attr.to_string(), serde_json::Value::from("")),
        })
        .collect()
}

#[async_trait]
impl<S> DeviceSession for RouterOsSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn run_command(
        &mut self,
        command: &str,
        args: &[(&str, &str)],
    ) -> Result<Vec<Record>, DeviceError> {
        let mut words = vec![command.to_string()];
        words.extend(args.iter().map(|(k, v)| format!("={k}={v}")));

        match self.exchange(&words).await? {
            Reply::Done(records, _) => Ok(records),
            Reply::Trap(message) => Err(DeviceError::Trap {
                command: command.to_string(),
                message,
            }),
        }
    }

    async fn close(&mut self) {
        let quit = ["/quit".to_string()];
        let _ = tokio::time::timeout(self.io_timeout, write_sentence(&mut self.stream, &quit)).await;
        let _ = self.stream.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::DuplexStream;

    fn sentence(words: &[&str]) -> Vec<String> {
        words.iter().map(|w| w.to_string()).collect()
    }

    /// Minimal in-process device speaking the API protocol.
    async fn fake_device(mut io: DuplexStream, legacy_login: bool) {
        loop {
            let Ok(words) = read_sentence(&mut io).await else {
                return;
            };
            let replies = match words[0].as_str() {
                "/login" if legacy_login => {
                    vec![sentence(&["!done", "=ret=ebddd18303a54111e2dea05a92ab46b4"])]
                }
                "/login" if words.iter().any(|w| w == "=password=s3cr3t") => {
                    vec![sentence(&["!done"])]
                }
                "/login" => vec![
                    sentence(&["!trap", "=message=invalid user name or password (6)"]),
                    sentence(&["!done"]),
                ],
                "/system/resource/print" => vec![
                    sentence(&["!re", "=uptime=2m", "=cpu-load=5", "=version=7.14"]),
                    sentence(&["!done"]),
                ],
                "/interface/print" => vec![
                    sentence(&["!re", "=.id=*1", "=name=ether1", "=running=true"]),
                    sentence(&["!re", "=.id=*2", "=name=ether2", "=comment="]),
                    sentence(&["!done"]),
                ],
                "/log/print" => vec![sentence(&["!empty"]), sentence(&["!done"])],
                "/quit" => {
                    let bye = sentence(&["!fatal", "session terminated on request"]);
                    let _ = write_sentence(&mut io, &bye).await;
                    return;
                }
                "/system/reboot" => {
                    let _ = write_sentence(&mut io, &sentence(&["!fatal", "not allowed"])).await;
                    return;
                }
                _ => vec![
                    sentence(&["!trap", "=message=no such command"]),
                    sentence(&["!done"]),
                ],
            };
            for reply in replies {
                if write_sentence(&mut io, &reply).await.is_err() {
                    return;
                }
            }
        }
    }

    async fn connect(password: &str, legacy: bool) -> Result<RouterOsSession<DuplexStream>, DeviceError> {
        let (client, server) = tokio::io::duplex(4096);
        tokio::spawn(fake_device(server, legacy));
        RouterOsSession::login(client, "admin", password, Duration::from_secs(2)).await
    }

    #[tokio::test]
    async fn test_login_and_system_resources() {
        let mut session = connect("s3cr3t", false).await.unwrap();
        let records = session.run_command("/system/resource/print", &[]).await.unwrap();

        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["cpu-load"], "5");
        assert_eq!(records[0]["uptime"], "2m");
        session.close().await;
    }

    #[tokio::test]
    async fn test_interfaces_keep_order_and_empty_values() {
        let mut session = connect("s3cr3t", false).await.unwrap();
        let session: &mut dyn DeviceSession = &mut session;
        let interfaces = session.interfaces().await.unwrap();

        assert_eq!(interfaces.len(), 2);
        assert_eq!(interfaces[0][".id"], "*1");
        assert_eq!(interfaces[1]["name"], "ether2");
        assert_eq!(interfaces[1]["comment"], "");
    }

    #[tokio::test]
    async fn test_bad_password_is_auth_error() {
        let err = connect("wrong", false).await.unwrap_err();
        match err {
            DeviceError::Auth(message) => assert!(message.contains("invalid user name")),
            other => panic!("expected auth error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_challenge_login_rejected() {
        let err = connect("s3cr3t", true).await.unwrap_err();
        assert!(matches!(err, DeviceError::Auth(_)));
    }

    #[tokio::test]
    async fn test_trap_leaves_session_usable() {
        let mut session = connect("s3cr3t", false).await.unwrap();

        let err = session.run_command("/nope", &[]).await.unwrap_err();
        assert!(matches!(err, DeviceError::Trap { ref message, .. } if message == "no such command"));

        let records = session.run_command("/system/resource/print", &[]).await.unwrap();
        assert_eq!(records.len(), 1);
    }

    #[tokio::test]
    async fn test_empty_reply() {
        let mut session = connect("s3cr3t", false).await.unwrap();
        let records = session.run_command("/log/print", &[]).await.unwrap();
        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn test_fatal_reply() {
        let mut session = connect("s3cr3t", false).await.unwrap();
        let err = session.run_command("/system/reboot", &[]).await.unwrap_err();
        assert!(matches!(err, DeviceError::Fatal(ref m) if m.contains("not allowed")));
    }

    #[tokio::test]
    async fn test_silent_device_times_out() {
        let (client, _server) = tokio::io::duplex(4096);
        let err = RouterOsSession::login(client, "admin", "pw", Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, DeviceError::Timeout));
    }

    #[test]
    fn test_resolve_address() {
        assert_eq!(resolve_address("10.0.0.1", 8728), "10.0.0.1:8728");
        assert_eq!(resolve_address("10.0.0.1:8729", 8728), "10.0.0.1:8729");
        assert_eq!(resolve_address("fe80::1", 8728), "[fe80::1]:8728");
        assert_eq!(resolve_address("[fe80::1]:8000", 8728), "[fe80::1]:8000");
        assert_eq!(resolve_address("router.lan", 8728), "router.lan:8728");
        assert_eq!(resolve_address("router.lan:9000", 8728), "router.lan:9000");
    }

    #[tokio::test]
    async fn test_connector_refused() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let creds = Credentials {
            address: addr.to_string(),
            username: "admin".into(),
            password: Zeroizing::new("pw".into()),
        };
        let Err(err) = RouterOsConnector::new().connect(&creds).await else {
            panic!("expected connection refused");
        };
        assert!(matches!(err, DeviceError::Io(_)));
    }
}
