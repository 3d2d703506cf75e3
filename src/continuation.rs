//! Lets a handler suspend mid-request while it waits on upstream I/O (a
//! FastCGI backend, for instance) and resume later on the handler stage,
//! without the pipeline needing real coroutines. The original core stored
//! an untyped `void*` per connection; here a typed slot plus downcast
//! accessors give callers back their own state type instead of a pointer
//! they have to trust.

use crate::connection::ConnectionInner;
use crate::error::Error;

/// Stores `state` in the connection's continuation slot, replacing
/// whatever was there before.
pub fn suspend<T: Send + 'static>(conn: &mut ConnectionInner, state: T) {
    conn.continuation = Some(Box::new(state));
}

/// Takes the continuation slot's contents if present and of type `T`.
/// Returns `Err(ContinuationTypeMismatch)` with the slot's contents put
/// back if the stored type doesn't match — a stage should treat that as a
/// bug in whatever put it there, not a normal "nothing to resume" case
/// (use [`has_continuation`] to distinguish the two).
pub fn resume<T: Send + 'static>(conn: &mut ConnectionInner) -> Result<Option<T>, Error> {
    match conn.continuation.take() {
        None => Ok(None),
        Some(boxed) => match boxed.downcast::<T>() {
            Ok(value) => Ok(Some(*value)),
            Err(boxed) => {
                conn.continuation = Some(boxed);
                Err(Error::ContinuationTypeMismatch)
            }
        },
    }
}

pub fn has_continuation(conn: &ConnectionInner) -> bool {
    conn.continuation.is_some()
}

pub fn reset(conn: &mut ConnectionInner) {
    conn.continuation = None;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{TcpListener, TcpStream};

    struct Dummy {
        value: u32,
    }

    fn inner() -> crate::connection::Connection {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let _client = TcpStream::connect(addr).unwrap();
        let (server, peer) = listener.accept().unwrap();
        crate::connection::Connection::new(1, server, peer).unwrap()
    }

    #[test]
    fn suspend_then_resume_round_trips_typed_state() {
        let conn = inner();
        let mut guard = conn.lock();

        assert!(!has_continuation(&guard));
        suspend(&mut guard, Dummy { value: 42 });
        assert!(has_continuation(&guard));

        let resumed: Dummy = resume::<Dummy>(&mut guard).unwrap().unwrap();
        assert_eq!(resumed.value, 42);
        assert!(!has_continuation(&guard));
    }

    #[test]
    fn resume_with_wrong_type_leaves_slot_intact() {
        let conn = inner();
        let mut guard = conn.lock();

        suspend(&mut guard, Dummy { value: 1 });
        assert!(resume::<u64>(&mut guard).is_err());
        assert!(has_continuation(&guard));
    }
}
