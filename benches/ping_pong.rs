// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use criterion::{Criterion, criterion_group, criterion_main};
use weft::{Deadline, Runtime, channel, close, join, recv, send, spawn, yield_now};

const PINGS: usize = 10_000;

fn yield_10k(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    c.bench_function("yield_10k", |b| {
        b.iter(|| {
            rt.block_on(async {
                let h = spawn(async {
                    for _ in 0..PINGS {
                        yield_now().await.unwrap();
                    }
                })
                .unwrap();
                join(h, Deadline::FOREVER).await.unwrap();
                close(h).unwrap();
            });
        });
    });
}

fn ping_pong_10k(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    c.bench_function("ping_pong_10k", |b| {
        b.iter(|| {
            rt.block_on(async {
                let (h0, h1) = channel().unwrap();
                let pong = spawn(async move {
                    let mut buf = [0u8; 8];
                    for _ in 0..PINGS {
                        recv(h1, &mut buf, Deadline::FOREVER).await.unwrap();
                        send(h1, &buf, Deadline::FOREVER).await.unwrap();
                    }
                })
                .unwrap();
                let mut buf = [0u8; 8];
                for i in 0..PINGS {
                    buf = (i as u64).to_ne_bytes();
                    send(h0, &buf, Deadline::FOREVER).await.unwrap();
                    recv(h0, &mut buf, Deadline::FOREVER).await.unwrap();
                    assert_eq!(u64::from_ne_bytes(buf), i as u64);
                }
                join(pong, Deadline::FOREVER).await.unwrap();
                close(pong).unwrap();
                close(h0).unwrap();
                close(h1).unwrap();
            });
        });
    });
}

criterion_group!(benches, yield_10k, ping_pong_10k);
criterion_main!(benches);
