//! Service manager readiness notification (`NOTIFY_SOCKET`)

use std::io;

/// Environment variable naming the supervisor's datagram socket
pub const NOTIFY_SOCKET_ENV: &str = "NOTIFY_SOCKET";

/// Send `state` to the socket named by `NOTIFY_SOCKET`
///
/// Returns `Ok(false)` when no supervisor is listening.
pub fn notify(state: &str) -> io::Result<bool> {
    match std::env::var(NOTIFY_SOCKET_ENV) {
        Ok(socket) if !socket.is_empty() => {
            notify_to(&socket, state)?;
            Ok(true)
        }
        _ => Ok(false),
    }
}

pub fn notify_ready(sites: usize) -> io::Result<bool> {
    notify(&format!("READY=1\nSTATUS=serving {} sites", sites))
}

pub fn notify_stopping() -> io::Result<bool> {
    notify("STOPPING=1")
}

/// Send `state` to `socket`; a leading `@` names a Linux abstract socket
#[cfg(unix)]
pub fn notify_to(socket: &str, state: &str) -> io::Result<()> {
    use std::os::unix::net::UnixDatagram;

    let sender = UnixDatagram::unbound()?;
    match socket.strip_prefix('@') {
        #[cfg(any(target_os = "linux", target_os = "android"))]
        Some(name) => {
            #[cfg(target_os = "android")]
            use std::os::android::net::SocketAddrExt;
            #[cfg(target_os = "linux")]
            use std::os::linux::net::SocketAddrExt;

            let addr = std::os::unix::net::SocketAddr::from_abstract_name(name.as_bytes())?;
            sender.send_to_addr(state.as_bytes(), &addr)?;
        }
        _ => {
            sender.send_to(state.as_bytes(), socket)?;
        }
    }
    Ok(())
}

#[cfg(not(unix))]
pub fn notify_to(_socket: &str, _state: &str) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "readiness notification needs unix sockets",
    ))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::net::UnixDatagram;

    #[test]
    fn test_notify_to_path_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notify.sock");
        let receiver = UnixDatagram::bind(&path).unwrap();

        notify_to(path.to_str().unwrap(), "READY=1\nSTATUS=serving 2 sites").unwrap();

        let mut buf = [0u8; 128];
        let n = receiver.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"READY=1\nSTATUS=serving 2 sites");
    }

    #[test]
    fn test_notify_to_missing_socket_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.sock");
        assert!(notify_to(path.to_str().unwrap(), "READY=1").is_err());
    }
}
