//! Mailboxes and envelopes.
//!
//! Each process owns one unbounded FIFO mailbox: any thread may enqueue, the
//! process's dispatch thread is the single consumer. The channel guarantees
//! enqueue order equals handling order, and a dropped receiver makes every
//! pending reply fail fast instead of hanging.

use crossbeam_channel::{unbounded, Receiver, Sender};

use hive_wire::Term;

use super::process::ExitReason;

/// A queued message addressed to one process.
#[derive(Debug)]
pub(crate) enum Envelope {
    /// Synchronous request; the handler's reply (or failure) is delivered
    /// through `reply` exactly once.
    Call {
        reply: Sender<Result<Term, CallFault>>,
        payload: Term,
    },
    /// Fire-and-forget message.
    Cast { payload: Term },
    /// Termination signal; the dispatch loop exits after handling it.
    Stop { reason: ExitReason },
}

/// Why a call envelope's reply is a failure.
#[derive(Debug, Clone)]
pub(crate) enum CallFault {
    /// The handler raised an application error.
    Handler(String),
    /// The process stopped before handling the call.
    Stopped,
}

/// A fresh mailbox: the sender side fans out to producers, the receiver side
/// is owned by the dispatch thread.
pub(crate) fn mailbox() -> (Sender<Envelope>, Receiver<Envelope>) {
    unbounded()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn cast(n: i64) -> Envelope {
        Envelope::Cast {
            payload: Term::Int(n),
        }
    }

    fn payload_of(env: Envelope) -> i64 {
        match env {
            Envelope::Cast { payload } => payload.as_i64().unwrap(),
            _ => panic!("expected cast"),
        }
    }

    #[test]
    fn test_fifo_order() {
        let (tx, rx) = mailbox();
        for n in 0..10 {
            tx.send(cast(n)).unwrap();
        }
        for n in 0..10 {
            assert_eq!(payload_of(rx.recv().unwrap()), n);
        }
    }

    #[test]
    fn test_concurrent_producers_all_delivered() {
        let (tx, rx) = mailbox();
        let threads = 8;
        let per_thread = 100;

        let handles: Vec<_> = (0..threads)
            .map(|t| {
                let tx = tx.clone();
                std::thread::spawn(move || {
                    for i in 0..per_thread {
                        tx.send(cast((t * per_thread + i) as i64)).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        drop(tx);

        let mut count = 0;
        while rx.recv().is_ok() {
            count += 1;
        }
        assert_eq!(count, threads * per_thread);
    }

    #[test]
    fn test_per_sender_order_preserved() {
        // Messages from one producer arrive in the order it sent them, even
        // with another producer interleaving.
        let (tx, rx) = mailbox();
        let tx2 = tx.clone();
        let a = std::thread::spawn(move || {
            for n in 0..100 {
                tx.send(cast(n)).unwrap();
            }
        });
        let b = std::thread::spawn(move || {
            for n in 1000..1100 {
                tx2.send(cast(n)).unwrap();
            }
        });
        a.join().unwrap();
        b.join().unwrap();

        let mut last_a = -1;
        let mut last_b = 999;
        for _ in 0..200 {
            let v = payload_of(rx.recv().unwrap());
            if v < 1000 {
                assert!(v > last_a);
                last_a = v;
            } else {
                assert!(v > last_b);
                last_b = v;
            }
        }
    }

    #[test]
    fn test_dropped_receiver_fails_send() {
        let (tx, rx) = mailbox();
        drop(rx);
        assert!(tx.send(cast(1)).is_err());
    }
}
