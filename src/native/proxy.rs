//! ProxyCommand transport
//!
//! Runs the configured command through `sh -c` and speaks SSH over its
//! stdin/stdout, the way OpenSSH does for `ProxyCommand`. The stream is handed
//! to `russh::client::connect_stream()` like any other transport.

use std::io;
use std::pin::Pin;
use std::process::Stdio;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, info};

/// Expand `%h`, `%p`, `%r` and `%%` in a ProxyCommand template
pub fn expand_command(template: &str, host: &str, port: u16, user: &str) -> String {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('h') => out.push_str(host),
            Some('p') => out.push_str(&port.to_string()),
            Some('r') => out.push_str(user),
            Some('%') => out.push('%'),
            Some(other) => {
                out.push('%');
                out.push(other);
            }
            None => out.push('%'),
        }
    }
    out
}

/// Child process stdio as one bidirectional stream
///
/// The child is killed when the stream is dropped.
pub struct ProxyCommandStream {
    _child: Child,
    stdin: ChildStdin,
    stdout: ChildStdout,
}

impl ProxyCommandStream {
    /// Spawn the command; must be called inside the tokio runtime
    pub fn spawn(command: &str) -> io::Result<Self> {
        info!("Starting ProxyCommand: {}", command);
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::other("ProxyCommand stdin unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("ProxyCommand stdout unavailable"))?;

        debug!("ProxyCommand started with pid {:?}", child.id());
        Ok(Self {
            _child: child,
            stdin,
            stdout,
        })
    }
}

impl AsyncRead for ProxyCommandStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stdout).poll_read(cx, buf)
    }
}

impl AsyncWrite for ProxyCommandStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stdin).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stdin).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stdin).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_expand_command() {
        assert_eq!(
            expand_command("nc -X connect -x proxy:3128 %h %p", "example.org", 2222, "alice"),
            "nc -X connect -x proxy:3128 example.org 2222"
        );
        assert_eq!(
            expand_command("ssh -W %h:%p %r@jump", "db", 22, "bob"),
            "ssh -W db:22 bob@jump"
        );
        assert_eq!(expand_command("echo 100%% %x %", "h", 1, "u"), "echo 100% %x %");
    }

    #[test]
    fn test_stream_talks_to_child() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            let mut stream = ProxyCommandStream::spawn("cat").unwrap();
            stream.write_all(b"SSH-2.0-test\r\n").await.unwrap();
            stream.flush().await.unwrap();

            let mut buf = [0u8; 14];
            stream.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"SSH-2.0-test\r\n");
        });
    }
}
