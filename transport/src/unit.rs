use crate::{Transport, TransportError};
use tracing::{debug, trace};

#[derive(Debug)]
pub enum CloseReason {
    /// Peer closed between records.
    OrderlyClose,
    ShortRead { received: usize },
    ShortWrite { sent: usize },
    Fault(TransportError),
}

#[derive(Debug)]
pub enum UnitState {
    Active,
    Closing(CloseReason),
    Terminated(UnitReport),
}

#[derive(Debug)]
pub struct UnitReport {
    pub id: u64,
    pub records: u64,
    pub reason: CloseReason,
}

/// Serves one connection: every fixed-size record received is sent back
/// unchanged until the peer closes or a transfer comes up short.
pub struct EchoUnit {
    id: u64,
    transport: Transport,
    buf: Vec<u8>,
    records: u64,
}

impl EchoUnit {
    pub fn new(id: u64, transport: Transport, record_size: usize) -> Self {
        EchoUnit {
            id,
            transport,
            buf: vec![0u8; record_size],
            records: 0,
        }
    }

    pub fn run(mut self) -> UnitReport {
        debug!(unit = self.id, "connection unit started");
        let mut state = UnitState::Active;
        loop {
            state = match self.advance(state) {
                UnitState::Terminated(report) => return report,
                next => next,
            };
        }
    }

    fn advance(&mut self, state: UnitState) -> UnitState {
        match state {
            UnitState::Active => self.echo_one(),
            UnitState::Closing(reason) => {
                self.transport.destroy();
                debug!(unit = self.id, records = self.records, ?reason, "connection unit closing");
                UnitState::Terminated(UnitReport {
                    id: self.id,
                    records: self.records,
                    reason,
                })
            }
            terminated @ UnitState::Terminated(_) => terminated,
        }
    }

    fn echo_one(&mut self) -> UnitState {
        let expected = self.buf.len();
        match self.transport.recv(&mut self.buf) {
            Ok(0) => return UnitState::Closing(CloseReason::OrderlyClose),
            Ok(n) if n != expected => {
                return UnitState::Closing(CloseReason::ShortRead { received: n })
            }
            Ok(_) => {}
            Err(e) => return UnitState::Closing(CloseReason::Fault(e)),
        }

        match self.transport.send(&self.buf) {
            Ok(n) if n == expected => {
                self.records += 1;
                trace!(unit = self.id, records = self.records, "record echoed");
                UnitState::Active
            }
            Ok(n) => UnitState::Closing(CloseReason::ShortWrite { sent: n }),
            Err(e) => UnitState::Closing(CloseReason::Fault(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TransportOptions;
    use rstest::*;
    use std::thread;

    fn pair() -> (Transport, Transport) {
        let server =
            Transport::create(&TransportOptions::tcp_server(Some("127.0.0.1"), 0)).unwrap();
        let port = server.local_addr().unwrap().port();
        let client = Transport::create(&TransportOptions::tcp_client("127.0.0.1", port)).unwrap();
        let accepted = server.accept().unwrap();
        (client, accepted)
    }

    #[rstest]
    #[case(0)]
    #[case(1)]
    #[case(25)]
    fn test_echoes_records_until_close(#[case] count: u64) {
        let (mut client, accepted) = pair();
        let unit = thread::spawn(move || EchoUnit::new(7, accepted, 32).run());

        let mut buf = [0u8; 32];
        for i in 0..count {
            let record = [i as u8; 32];
            assert_eq!(client.send(&record).unwrap(), 32);
            assert_eq!(client.recv(&mut buf).unwrap(), 32);
            assert_eq!(buf, record);
        }
        client.destroy();

        let report = unit.join().unwrap();
        assert_eq!(report.id, 7);
        assert_eq!(report.records, count);
        assert!(matches!(report.reason, CloseReason::OrderlyClose));
    }

    #[test]
    fn test_partial_record_is_short_read() {
        let (mut client, accepted) = pair();
        let unit = thread::spawn(move || EchoUnit::new(1, accepted, 32).run());

        client.send(&[1u8; 32]).unwrap();
        let mut buf = [0u8; 32];
        client.recv(&mut buf).unwrap();
        client.send(&[2u8; 10]).unwrap();
        client.destroy();

        let report = unit.join().unwrap();
        assert_eq!(report.records, 1);
        assert!(matches!(report.reason, CloseReason::ShortRead { received: 10 }));
    }
}
