use crate::{CancellationToken, Result, Role, Transport, TransportError};
use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use std::io::ErrorKind;
use tracing::{debug, warn};

const LISTENER_TOKEN: u64 = 0;
const CANCEL_TOKEN: u64 = 1;

/// Accept loop over a listening transport that stops as soon as its
/// [`CancellationToken`] fires.
pub struct Acceptor {
    listener: Transport,
    token: CancellationToken,
    epoll: Epoll,
    events: Vec<EpollEvent>,
}

impl Acceptor {
    pub fn new(listener: Transport, token: &CancellationToken) -> Result<Self> {
        if listener.role() != Role::Server {
            return Err(TransportError::WrongRole {
                expected: Role::Server,
                op: "accept",
            });
        }
        let listener_fd = listener.as_fd().ok_or(TransportError::UnsupportedKind {
            kind: listener.kind(),
            op: "accept",
        })?;

        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)?;
        epoll.add(listener_fd, EpollEvent::new(EpollFlags::EPOLLIN, LISTENER_TOKEN))?;
        epoll.add(token.fd(), EpollEvent::new(EpollFlags::EPOLLIN, CANCEL_TOKEN))?;
        listener.set_nonblocking(true)?;

        Ok(Acceptor {
            listener,
            token: token.clone(),
            epoll,
            events: vec![EpollEvent::empty(); 2],
        })
    }

    /// Waits for the next connection. Returns `None` once the token is
    /// cancelled, even if connections are still queued.
    pub fn next(&mut self) -> Result<Option<Transport>> {
        loop {
            if self.token.is_cancelled() {
                return Ok(None);
            }

            let nfds = match self.epoll.wait(&mut self.events, EpollTimeout::NONE) {
                Ok(n) => n,
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            };

            let ready = &self.events[..nfds];
            if self.token.is_cancelled() || ready.iter().any(|e| e.data() == CANCEL_TOKEN) {
                debug!("acceptor cancelled");
                return Ok(None);
            }
            if !ready.iter().any(|e| e.data() == LISTENER_TOKEN) {
                continue;
            }

            match self.listener.accept() {
                Ok(transport) => return Ok(Some(transport)),
                Err(TransportError::Io(e)) if e.kind() == ErrorKind::WouldBlock => continue,
                Err(e) => {
                    warn!(error = %e, "error accepting connection");
                    continue;
                }
            }
        }
    }

    pub fn listener(&self) -> &Transport {
        &self.listener
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::tests::{install_interrupt_handler, interrupt, spawn_interruptible};
    use crate::TransportOptions;
    use std::thread;
    use std::time::Duration;

    fn listen() -> (Transport, u16) {
        let server =
            Transport::create(&TransportOptions::tcp_server(Some("127.0.0.1"), 0)).unwrap();
        let port = server.local_addr().unwrap().port();
        (server, port)
    }

    #[test]
    fn test_accepts_queued_connections() -> Result<()> {
        let (server, port) = listen();
        let token = CancellationToken::new()?;
        let mut acceptor = Acceptor::new(server, &token)?;

        let clients: Vec<_> = (0..3)
            .map(|_| {
                Transport::create(&TransportOptions::tcp_client("127.0.0.1", port)).unwrap()
            })
            .collect();

        for _ in 0..clients.len() {
            let accepted = acceptor.next()?.expect("connection queued");
            assert_eq!(accepted.role(), Role::Client);
        }
        Ok(())
    }

    #[test]
    fn test_cancel_wakes_blocked_acceptor() -> Result<()> {
        let (server, _) = listen();
        let token = CancellationToken::new()?;
        let mut acceptor = Acceptor::new(server, &token)?;

        let canceller = token.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            canceller.cancel();
        });

        assert!(acceptor.next()?.is_none());
        handle.join().unwrap();
        Ok(())
    }

    #[test]
    fn test_cancel_wins_over_pending_connection() -> Result<()> {
        let (server, port) = listen();
        let token = CancellationToken::new()?;
        let mut acceptor = Acceptor::new(server, &token)?;

        let _client = Transport::create(&TransportOptions::tcp_client("127.0.0.1", port))?;
        token.cancel();
        assert!(acceptor.next()?.is_none());
        Ok(())
    }

    #[test]
    fn test_signals_do_not_drop_queued_connection() -> Result<()> {
        install_interrupt_handler();
        let (server, port) = listen();
        let token = CancellationToken::new()?;
        let mut acceptor = Acceptor::new(server, &token)?;

        let (waiter, handle) = spawn_interruptible(move || {
            let accepted = acceptor.next();
            (accepted, acceptor)
        });
        interrupt(waiter, 10);
        let mut client = Transport::create(&TransportOptions::tcp_client("127.0.0.1", port))?;

        let (accepted, acceptor) = handle.join().unwrap();
        let mut accepted = accepted?.expect("queued connection accepted");
        assert!(acceptor.listener().local_addr().is_ok());

        assert_eq!(client.send(b"still here")?, 10);
        let mut buf = [0u8; 10];
        assert_eq!(accepted.recv(&mut buf)?, 10);
        assert_eq!(&buf, b"still here");
        Ok(())
    }

    #[test]
    fn test_rejects_client_handle() -> Result<()> {
        let (_server, port) = listen();
        let token = CancellationToken::new()?;
        let client = Transport::create(&TransportOptions::tcp_client("127.0.0.1", port))?;
        assert!(matches!(
            Acceptor::new(client, &token),
            Err(TransportError::WrongRole { .. })
        ));
        Ok(())
    }
}
