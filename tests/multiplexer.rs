mod common;

use std::{
    io::Read,
    os::unix::fs::FileExt,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use common::{drain, file_with, multiplexers, pipe};
use io_multiplexer::{
    BackendKind, BarrierKind, CancelStatus, Cancellation, Completion, Config, Deadline, Error,
    Handle, Multiplexer, Operation, OperationKind, Outcome, Phase, Request,
};

#[test]
fn poll_is_idempotent() {
    for multiplexer in multiplexers(Config::default()) {
        let handle = file_with(&multiplexer, b"abcdef");
        let operation = Operation::new(&handle, Request::read_exact(0, 6));

        assert_eq!(operation.poll(), Phase::Unsubmitted);
        operation.submit(&multiplexer).unwrap();
        assert_eq!(operation.poll(), Phase::InProgress);
        assert_eq!(operation.poll(), Phase::InProgress);

        drain(&multiplexer);
        assert_eq!(operation.poll(), Phase::Completed);
        assert_eq!(operation.poll(), Phase::Completed);
        assert_eq!(operation.take_buffers(), Some(vec![b"abcdef".to_vec()]));
    }
}

#[test]
fn expired_deadline_returns_without_blocking() {
    for multiplexer in multiplexers(Config::default()) {
        let (reader, _writer) = pipe(&multiplexer);
        let operation = Operation::new(&reader, Request::read_exact(0, 8));
        operation.submit(&multiplexer).unwrap();

        let started = Instant::now();
        assert_eq!(operation.wait(Deadline::IMMEDIATE), Err(Error::TimedOut));
        assert!(started.elapsed() < Duration::from_millis(500));
        assert_eq!(operation.poll(), Phase::InProgress);

        assert_eq!(multiplexer.run_once(Deadline::IMMEDIATE), Err(Error::TimedOut));
        assert_eq!(operation.poll(), Phase::InProgress);

        operation.cancel().unwrap();
        drain(&multiplexer);
        assert_eq!(operation.poll(), Phase::Cancelled);
    }
}

#[test]
fn cancelling_terminal_changes_nothing() {
    for multiplexer in multiplexers(Config::default()) {
        let handle = file_with(&multiplexer, b"done");
        let operation = Operation::new(&handle, Request::read_exact(0, 4));
        operation.submit(&multiplexer).unwrap();

        let outcome = operation.wait(Deadline::NEVER).unwrap();
        assert_eq!(
            outcome,
            Outcome::Completed(Completion {
                requested: 4,
                transferred: 4,
            })
        );

        assert_eq!(operation.cancel(), Ok(Cancellation::Finished(outcome.clone())));
        assert_eq!(operation.poll(), Phase::Completed);
        assert_eq!(operation.outcome(), Some(outcome));
        assert_eq!(operation.cancel_status(), None);
    }
}

#[test]
fn disjoint_reads_are_attributed() {
    const COUNT: usize = 32;
    const CHUNK: usize = 128;

    for multiplexer in multiplexers(Config::default()) {
        let contents: Vec<u8> = (0..COUNT * CHUNK).map(|index| (index / CHUNK) as u8).collect();
        let handle = file_with(&multiplexer, &contents);

        let operations: Vec<_> = (0..COUNT)
            .map(|chunk| {
                let operation =
                    Operation::new(&handle, Request::read_exact((chunk * CHUNK) as u64, CHUNK));
                operation.submit(&multiplexer).unwrap();
                operation
            })
            .collect();

        assert_eq!(multiplexer.in_flight(), COUNT);
        assert_eq!(drain(&multiplexer), COUNT);

        for (chunk, operation) in operations.iter().enumerate() {
            assert_eq!(operation.poll(), Phase::Completed);

            let buffers = operation.take_buffers().unwrap();
            assert_eq!(buffers.len(), 1);
            assert!(buffers[0].iter().all(|byte| usize::from(*byte) == chunk));
            assert_eq!(buffers[0].len(), CHUNK);
        }
    }
}

#[test]
fn scattered_read_fills_in_order() {
    for multiplexer in multiplexers(Config::default()) {
        let handle = file_with(&multiplexer, b"0123456789");
        let operation = Operation::new(
            &handle,
            Request::read(2, vec![vec![0; 3], vec![0; 2], vec![0; 4]]),
        );
        operation.submit(&multiplexer).unwrap();
        drain(&multiplexer);

        assert_eq!(
            operation.take_buffers(),
            Some(vec![b"234".to_vec(), b"56".to_vec(), b"789".to_vec()])
        );
    }
}

#[test]
fn write_lands_in_empty_file() {
    for multiplexer in multiplexers(Config::default()) {
        let file = tempfile::tempfile().unwrap();
        let handle = Arc::new(Handle::from_file(file.try_clone().unwrap()).unwrap());
        multiplexer.register_handle(&handle).unwrap();

        let data: Vec<u8> = (0..4096).map(|index| (index % 251) as u8).collect();
        let operation = Operation::new(&handle, Request::write(0, vec![data.clone()]));
        operation.submit(&multiplexer).unwrap();

        let completion = operation.wait(Deadline::NEVER).unwrap().into_result().unwrap();
        assert_eq!(completion.transferred, 4096);
        assert!(!completion.is_short());

        let mut written = Vec::new();
        (&file).read_to_end(&mut written).unwrap();
        assert_eq!(written, data);
    }
}

#[test]
fn short_read_at_end_of_file() {
    for multiplexer in multiplexers(Config::default()) {
        let handle = file_with(&multiplexer, b"ten bytes!");
        let operation = Operation::new(&handle, Request::read_exact(0, 64));
        operation.submit(&multiplexer).unwrap();

        let Outcome::Completed(completion) = operation.wait(Deadline::NEVER).unwrap() else {
            panic!("read should complete");
        };

        assert_eq!(completion.requested, 64);
        assert_eq!(completion.transferred, 10);
        assert!(completion.is_short());
        assert_eq!(
            completion.ensure_complete(),
            Err(Error::ShortTransfer {
                requested: 64,
                transferred: 10,
            })
        );
        assert_eq!(operation.take_buffers(), Some(vec![b"ten bytes!".to_vec()]));
    }
}

#[test]
fn sibling_failure_is_isolated() {
    for multiplexer in multiplexers(Config::default()) {
        let directory = tempfile::tempdir().unwrap();
        let directory = Arc::new(
            Handle::from_file(std::fs::File::open(directory.path()).unwrap()).unwrap(),
        );
        multiplexer.register_handle(&directory).unwrap();

        let file = file_with(&multiplexer, b"fine");

        let failing = Operation::new(&directory, Request::read_exact(0, 16));
        let succeeding = Operation::new(&file, Request::read_exact(0, 4));
        failing.submit(&multiplexer).unwrap();
        succeeding.submit(&multiplexer).unwrap();

        drain(&multiplexer);

        // EISDIR from read(2), EINVAL where the kernel refuses earlier
        assert!(matches!(
            failing.outcome(),
            Some(Outcome::Failed(Error::Io {
                code: libc::EISDIR | libc::EINVAL
            }))
        ));
        assert_eq!(failing.poll(), Phase::Failed);
        assert_eq!(succeeding.poll(), Phase::Completed);
        assert_eq!(succeeding.take_buffers(), Some(vec![b"fine".to_vec()]));
    }
}

#[test]
fn double_registration_is_rejected() {
    let first = Multiplexer::new(Config::default().backend(BackendKind::Poll)).unwrap();
    let second = Multiplexer::new(Config::default().backend(BackendKind::Poll)).unwrap();

    let handle = file_with(&first, b"");
    assert_eq!(handle.multiplexer(), Some(first.id()));

    first.register_handle(&handle).unwrap();
    assert_eq!(second.register_handle(&handle), Err(Error::AlreadyRegistered));

    let operation = Operation::new(&handle, Request::read_exact(0, 1));
    assert!(matches!(
        operation.submit(&second),
        Err(Error::InvalidArgument(_))
    ));
}

#[test]
fn malformed_submissions_leave_state_untouched() {
    for multiplexer in multiplexers(Config::default()) {
        let unregistered = Arc::new(Handle::from_file(tempfile::tempfile().unwrap()).unwrap());
        let operation = Operation::new(&unregistered, Request::read_exact(0, 4));
        assert_eq!(
            operation.submit(&multiplexer),
            Err(Error::InvalidArgument(
                "handle is not registered with this multiplexer"
            ))
        );
        assert_eq!(operation.poll(), Phase::Unsubmitted);

        let handle = file_with(&multiplexer, b"data");
        let empty = Operation::new(&handle, Request::read(0, Vec::new()));
        assert!(empty.submit(&multiplexer).is_err());
        assert_eq!(empty.poll(), Phase::Unsubmitted);

        let twice = Operation::new(&handle, Request::read_exact(0, 4));
        twice.submit(&multiplexer).unwrap();
        assert_eq!(
            twice.submit(&multiplexer),
            Err(Error::InvalidArgument("operation was already submitted"))
        );

        drain(&multiplexer);
        assert_eq!(twice.poll(), Phase::Completed);
    }
}

#[test]
fn blocked_read_cancels_or_refuses() {
    for multiplexer in multiplexers(Config::default()) {
        let (reader, writer) = pipe(&multiplexer);
        let operation = Operation::new(&reader, Request::read_exact(0, 16));
        operation.submit(&multiplexer).unwrap();

        // get the read issued to the backend
        assert_eq!(
            multiplexer.run_once(Deadline::after(Duration::from_millis(1))),
            Err(Error::TimedOut)
        );
        thread::sleep(Duration::from_millis(1));

        match operation.cancel() {
            Ok(Cancellation::Requested) => {
                assert_eq!(operation.cancel(), Ok(Cancellation::Requested));
                assert_eq!(operation.cancel_status(), Some(CancelStatus::Pending));
            }
            Err(Error::CannotCancel) => {
                multiplexer
                    .execute(&writer, Request::write(0, vec![b"late".to_vec()]), Deadline::NEVER)
                    .unwrap();
            }
            other => panic!("unexpected cancellation answer {other:?}"),
        }

        drain(&multiplexer);
        assert!(operation.poll().is_terminal());

        match operation.cancel_status() {
            Some(CancelStatus::Acknowledged) => assert_eq!(operation.poll(), Phase::Cancelled),
            Some(CancelStatus::Refused) | None => {
                assert_eq!(operation.poll(), Phase::Completed);
            }
            Some(CancelStatus::Pending) => panic!("cancellation left pending"),
        }
    }
}

#[test]
fn wait_timeout_keeps_operation_live() {
    for multiplexer in multiplexers(Config::default()) {
        let (reader, writer) = pipe(&multiplexer);
        let operation = Operation::new(&reader, Request::read_exact(0, 8));
        operation.submit(&multiplexer).unwrap();

        assert_eq!(
            operation.wait(Deadline::after(Duration::from_millis(20))),
            Err(Error::TimedOut)
        );
        assert_eq!(operation.poll(), Phase::InProgress);
        assert_eq!(operation.take_buffers(), None);

        let (written, _) = multiplexer
            .execute(&writer, Request::write(0, vec![b"abc".to_vec()]), Deadline::NEVER)
            .unwrap();
        assert_eq!(written.transferred, 3);

        let completion = operation.wait(Deadline::NEVER).unwrap().into_result().unwrap();
        assert_eq!(completion.transferred, 3);
        assert_eq!(operation.take_buffers(), Some(vec![b"abc".to_vec()]));
    }
}

#[test]
fn parallel_drivers_resolve_each_operation_once() {
    const OPERATIONS: usize = 64;
    const DRIVERS: usize = 4;

    for multiplexer in multiplexers(Config::default().parallel()) {
        let handle = file_with(&multiplexer, &[7; 4096]);
        let callbacks = Arc::new(AtomicUsize::new(0));

        let operations: Vec<_> = (0..OPERATIONS)
            .map(|index| {
                let operation =
                    Operation::new(&handle, Request::read_exact((index * 64) as u64, 64));

                let callbacks = callbacks.clone();
                operation.on_complete(move |outcome| {
                    assert!(matches!(outcome, Outcome::Completed(_)));
                    callbacks.fetch_add(1, Ordering::SeqCst);
                });

                operation.submit(&multiplexer).unwrap();
                operation
            })
            .collect();

        let drivers: Vec<_> = (0..DRIVERS)
            .map(|_| {
                let multiplexer = multiplexer.clone();
                thread::spawn(move || drain(&multiplexer))
            })
            .collect();

        let resolved: usize = drivers
            .into_iter()
            .map(|driver| driver.join().unwrap())
            .sum();

        assert_eq!(resolved, OPERATIONS);
        assert_eq!(callbacks.load(Ordering::SeqCst), OPERATIONS);
        assert!(operations
            .iter()
            .all(|operation| operation.poll() == Phase::Completed));
    }
}

#[test]
fn parallel_waiters_share_driving() {
    for multiplexer in multiplexers(Config::default()) {
        let handle = file_with(&multiplexer, &[1; 1024]);

        let waiters: Vec<_> = (0..8)
            .map(|index| {
                let operation = Operation::new(&handle, Request::read_exact(index * 128, 128));
                operation.submit(&multiplexer).unwrap();
                thread::spawn(move || operation.wait(Deadline::after(Duration::from_secs(10))))
            })
            .collect();

        for waiter in waiters {
            let outcome = waiter.join().unwrap().unwrap();
            assert_eq!(outcome.into_result().unwrap().transferred, 128);
        }
    }
}

#[test]
fn cooperative_multiplexer_has_one_driver() {
    for multiplexer in multiplexers(Config::default().cooperative()) {
        let handle = file_with(&multiplexer, b"cooperative");
        assert_eq!(multiplexer.run_once(Deadline::IMMEDIATE), Ok(0));

        let operation = Operation::new(&handle, Request::read_exact(0, 11));
        operation.submit(&multiplexer).unwrap();

        let foreign = multiplexer.clone();
        let waiter = thread::spawn(move || {
            assert!(matches!(
                foreign.run_once(Deadline::IMMEDIATE),
                Err(Error::InvalidArgument(_))
            ));

            // sleeps instead of driving
            operation.wait(Deadline::after(Duration::from_secs(10)))
        });

        while multiplexer.in_flight() > 0 {
            common::tick(&multiplexer, Duration::from_millis(10)).unwrap();
        }

        let outcome = waiter.join().unwrap().unwrap();
        assert_eq!(outcome.into_result().unwrap().transferred, 11);
    }
}

#[test]
fn idle_pass_is_immediate() {
    for multiplexer in multiplexers(Config::default()) {
        let started = Instant::now();
        assert_eq!(multiplexer.run_once(Deadline::NEVER), Ok(0));
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}

#[test]
fn submission_wakes_blocked_driver() {
    for multiplexer in multiplexers(Config::default()) {
        let (reader, _writer) = pipe(&multiplexer);
        let blocked = Operation::new(&reader, Request::read_exact(0, 1));
        blocked.submit(&multiplexer).unwrap();

        assert_eq!(
            multiplexer.run_once(Deadline::after(Duration::from_millis(1))),
            Err(Error::TimedOut)
        );

        let driver = {
            let multiplexer = multiplexer.clone();
            thread::spawn(move || {
                let started = Instant::now();
                let result = multiplexer.run_once(Deadline::after(Duration::from_secs(10)));
                (result, started.elapsed())
            })
        };

        thread::sleep(Duration::from_millis(20));

        let handle = file_with(&multiplexer, b"wake");
        let operation = Operation::new(&handle, Request::read_exact(0, 4));
        operation.submit(&multiplexer).unwrap();

        let (result, elapsed) = driver.join().unwrap();
        assert_eq!(result, Ok(1));
        assert!(elapsed < Duration::from_secs(5));
        assert_eq!(operation.poll(), Phase::Completed);

        blocked.cancel().unwrap();
        drain(&multiplexer);
    }
}

#[test]
fn deregistration_requires_idle_handle() {
    for multiplexer in multiplexers(Config::default()) {
        let (reader, _writer) = pipe(&multiplexer);
        let operation = Operation::new(&reader, Request::read_exact(0, 4));
        operation.submit(&multiplexer).unwrap();

        assert_eq!(
            multiplexer.deregister_handle(&reader),
            Err(Error::InvalidArgument("handle has operations in flight"))
        );

        operation.cancel().unwrap();
        drain(&multiplexer);

        multiplexer.deregister_handle(&reader).unwrap();
        assert_eq!(reader.multiplexer(), None);
        assert!(multiplexer.deregister_handle(&reader).is_err());

        let other = Multiplexer::new(Config::default().backend(BackendKind::Poll)).unwrap();
        other.register_handle(&reader).unwrap();
        assert_eq!(reader.multiplexer(), Some(other.id()));
    }
}

#[test]
fn barriers_complete() {
    for multiplexer in multiplexers(Config::default()) {
        let handle = file_with(&multiplexer, b"");

        multiplexer
            .execute(&handle, Request::write(0, vec![vec![3; 512]]), Deadline::NEVER)
            .unwrap();

        for kind in [
            BarrierKind::NowaitDataOnly,
            BarrierKind::WaitDataOnly,
            BarrierKind::NowaitAll,
            BarrierKind::WaitAll,
        ] {
            let operation = Operation::new(&handle, Request::barrier(kind));
            assert_eq!(operation.kind(), OperationKind::Barrier);
            operation.submit(&multiplexer).unwrap();

            let outcome = operation.wait(Deadline::NEVER).unwrap();
            assert_eq!(outcome.phase(), Phase::Completed, "{kind:?}");
            assert_eq!(operation.take_buffers(), Some(Vec::new()));
        }
    }
}

#[test]
fn execute_round_trips() {
    for multiplexer in multiplexers(Config::default()) {
        let handle = file_with(&multiplexer, b"");

        let (written, _) = multiplexer
            .execute(
                &handle,
                Request::write(100, vec![b"hello ".to_vec(), b"world".to_vec()]),
                Deadline::after(Duration::from_secs(10)),
            )
            .unwrap();
        assert_eq!(written.transferred, 11);

        let (read, buffers) = multiplexer
            .execute(&handle, Request::read_exact(100, 11), Deadline::NEVER)
            .unwrap();
        assert_eq!(read.transferred, 11);
        assert_eq!(buffers, vec![b"hello world".to_vec()]);
    }
}

#[test]
fn execute_times_out_blocked_reads() {
    for multiplexer in multiplexers(Config::default()) {
        let (reader, _writer) = pipe(&multiplexer);

        let result = multiplexer.execute(
            &reader,
            Request::read_exact(0, 4),
            Deadline::after(Duration::from_millis(20)),
        );

        assert_eq!(result, Err(Error::TimedOut));
        drain(&multiplexer);
    }
}

#[test]
fn dropping_multiplexer_cancels_in_flight() {
    for multiplexer in multiplexers(Config::default()) {
        let (reader, _writer) = pipe(&multiplexer);
        let operation = Operation::new(&reader, Request::read_exact(0, 4));
        operation.submit(&multiplexer).unwrap();

        assert_eq!(
            multiplexer.run_once(Deadline::after(Duration::from_millis(1))),
            Err(Error::TimedOut)
        );

        drop(multiplexer);

        assert_eq!(operation.poll(), Phase::Cancelled);
        assert_eq!(reader.multiplexer(), None);
        assert_eq!(operation.wait(Deadline::NEVER), Ok(Outcome::Cancelled));
    }
}

#[test]
fn positioned_writes_honor_offsets() {
    for multiplexer in multiplexers(Config::default()) {
        let file = tempfile::tempfile().unwrap();
        let handle = Arc::new(Handle::from_file(file.try_clone().unwrap()).unwrap());
        multiplexer.register_handle(&handle).unwrap();

        let operations: Vec<_> = [(0, b"aa"), (4, b"cc"), (2, b"bb")]
            .into_iter()
            .map(|(offset, data)| {
                let operation = Operation::new(&handle, Request::write(offset, vec![data.to_vec()]));
                operation.submit(&multiplexer).unwrap();
                operation
            })
            .collect();

        drain(&multiplexer);
        assert!(operations
            .iter()
            .all(|operation| operation.poll() == Phase::Completed));

        let mut contents = [0; 6];
        file.read_exact_at(&mut contents, 0).unwrap();
        assert_eq!(&contents, b"aabbcc");
    }
}

#[test]
fn registered_buffers_round_trip() {
    for multiplexer in multiplexers(Config::default()) {
        let handle = file_with(&multiplexer, b"");

        let mut outgoing = multiplexer.allocate_registered_buffer(100).unwrap();
        assert!(outgoing.len() >= 100);
        outgoing[..11].copy_from_slice(b"fixed pages");

        let write = Operation::new(&handle, Request::write_registered(0, outgoing, 11));
        write.submit(&multiplexer).unwrap();
        drain(&multiplexer);

        assert_eq!(
            write.outcome().unwrap().into_result().unwrap().transferred,
            11
        );
        let outgoing = write.take_registered_buffer().unwrap();
        if multiplexer.backend_name() == "poll" {
            assert!(!outgoing.is_registered());
        }

        let incoming = multiplexer.allocate_registered_buffer(64).unwrap();
        let read = Operation::new(&handle, Request::read_registered(0, incoming));
        read.submit(&multiplexer).unwrap();
        drain(&multiplexer);

        let completion = read.outcome().unwrap().into_result().unwrap();
        assert_eq!(completion.transferred, 11);
        assert!(completion.is_short());
        assert_eq!(read.take_buffers(), Some(Vec::new()));

        let incoming = read.take_registered_buffer().unwrap();
        assert_eq!(&incoming[..11], b"fixed pages");
        assert!(read.take_registered_buffer().is_none());
    }
}

#[test]
fn registered_requests_stay_inside_their_buffer() {
    for multiplexer in multiplexers(Config::default()) {
        let handle = file_with(&multiplexer, b"abc");
        let buffer = handle.allocate_registered_buffer(1).unwrap();
        let length = buffer.len();

        let operation = Operation::new(&handle, Request::write_registered(0, buffer, length + 1));
        assert!(matches!(
            operation.submit(&multiplexer),
            Err(Error::InvalidArgument(_))
        ));
        assert_eq!(operation.poll(), Phase::Unsubmitted);
        assert!(operation.take_registered_buffer().is_some());
    }
}
