//! Blocking point-to-point traffic across a local universe.

use std::collections::BTreeSet;

use ferroctl::transport::local;
use ferroctl::{Communicator, Error, ANY_SOURCE, ANY_TAG};
use pretty_assertions::assert_eq;

#[test]
fn messages_on_one_tag_arrive_in_order() {
    local::launch(2, |transport| {
        let world = Communicator::world(transport).unwrap();
        if world.rank() == 0 {
            for i in 0..32u64 {
                world.send(&[i, i * i], 1, 3).unwrap();
            }
        } else {
            for i in 0..32u64 {
                let mut buf = [0u64; 2];
                world.recv(&mut buf, 0, 3).unwrap();
                assert_eq!(buf, [i, i * i]);
            }
        }
    })
    .unwrap();
}

#[test]
fn tags_are_matched_independently() {
    local::launch(2, |transport| {
        let world = Communicator::world(transport).unwrap();
        if world.rank() == 0 {
            world.send(&[1i32], 1, 1).unwrap();
            world.send(&[2i32], 1, 2).unwrap();
        } else {
            let mut buf = [0i32];
            world.recv(&mut buf, 0, 2).unwrap();
            assert_eq!(buf, [2]);
            world.recv(&mut buf, 0, 1).unwrap();
            assert_eq!(buf, [1]);
        }
    })
    .unwrap();
}

#[test]
fn oversize_message_is_a_failure() {
    local::launch(2, |transport| {
        let world = Communicator::world(transport).unwrap();
        if world.rank() == 0 {
            world.send(&[1i32, 2, 3, 4], 1, 0).unwrap();
        } else {
            let mut small = [0i32; 2];
            match world.recv(&mut small, 0, 0) {
                Err(Error::Truncated { incoming, capacity }) => {
                    assert_eq!((incoming, capacity), (16, 8));
                }
                other => panic!("expected truncation, got {other:?}"),
            }
        }
    })
    .unwrap();
}

#[test]
fn shorter_message_reports_its_count() {
    local::launch(2, |transport| {
        let world = Communicator::world(transport).unwrap();
        if world.rank() == 0 {
            world.send(&[7.5f32; 3], 1, 4).unwrap();
        } else {
            let mut buf = [0.0f32; 8];
            let status = world.recv(&mut buf, ANY_SOURCE, ANY_TAG).unwrap();
            assert_eq!((status.source, status.tag, status.count, status.bytes), (0, 4, 3, 12));
            assert_eq!(&buf[..3], &[7.5; 3]);
        }
    })
    .unwrap();
}

#[test]
fn probe_reports_actual_source() {
    local::launch(4, |transport| {
        let world = Communicator::world(transport).unwrap();
        if world.rank() == 0 {
            assert!(world.iprobe::<u8>(ANY_SOURCE, 50).unwrap().is_none());
            let mut sources = BTreeSet::new();
            for _ in 1..world.size() {
                let status = world.probe::<u8>(ANY_SOURCE, ANY_TAG).unwrap();
                assert_eq!(status.tag, status.source * 10);
                assert_eq!(status.count, i64::from(status.source));
                // Probing does not consume.
                let again = world.iprobe::<u8>(status.source, status.tag).unwrap();
                assert_eq!(again, Some(status));
                let mut buf = vec![0u8; status.count as usize];
                world.recv(&mut buf, status.source, status.tag).unwrap();
                sources.insert(status.source);
            }
            assert_eq!(sources, (1..world.size()).collect::<BTreeSet<_>>());
        } else {
            let payload = vec![world.rank() as u8; world.rank() as usize];
            world.send(&payload, 0, world.rank() * 10).unwrap();
        }
    })
    .unwrap();
}

#[test]
fn sendrecv_around_a_ring() {
    let received = local::launch(5, |transport| {
        let world = Communicator::world(transport).unwrap();
        let next = (world.rank() + 1) % world.size();
        let prev = (world.rank() + world.size() - 1) % world.size();
        let mut buf = [0i64];
        let status = world
            .sendrecv(&[i64::from(world.rank())], next, 0, &mut buf, prev, 0)
            .unwrap();
        assert_eq!(status.source, prev);
        buf[0]
    })
    .unwrap();
    assert_eq!(received, vec![4, 0, 1, 2, 3]);
}

#[test]
fn synchronous_send_waits_for_the_receiver() {
    local::launch(2, |transport| {
        let world = Communicator::world(transport).unwrap();
        if world.rank() == 0 {
            world.send_synchronous(&[9u32], 1, 0).unwrap();
            world.send(&[0u32], 1, 1).unwrap();
        } else {
            let mut buf = [0u32];
            world.recv(&mut buf, 0, 0).unwrap();
            assert_eq!(buf, [9]);
            world.recv(&mut buf, 0, 1).unwrap();
        }
    })
    .unwrap();
}
