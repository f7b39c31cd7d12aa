use chrono::Utc;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tradefeed::signals::{parse, FilterCriteria, RawFrame, SignalRouter};
use tradefeed::types::{ParsedSignal, Side, Strength};

const SYMBOLS: [&str; 4] = ["BTC/USDT", "ETH/USDT", "SOL/USDT", "XRP/USDT"];

fn signals(n: usize) -> Vec<ParsedSignal> {
    (0..n)
        .filter_map(|i| {
            let frame = RawFrame::new(
                json!({"signal": {
                    "id": format!("sig-{i}"),
                    "symbol": SYMBOLS[i % SYMBOLS.len()],
                    "timeframe": "15m",
                    "side": if i % 2 == 0 { "BUY" } else { "SELL" },
                    "confidence": (i * 7 % 100) as f64,
                }}),
                Utc::now(),
            );
            parse(&frame).ok()
        })
        .collect()
}

fn bench_fanout(c: &mut Criterion) {
    let batch = signals(256);
    let mut group = c.benchmark_group("router_on_batch");

    for subscribers in [1usize, 16, 128] {
        let router = SignalRouter::new(100);
        let delivered = Arc::new(AtomicU64::new(0));
        for i in 0..subscribers {
            let counter = delivered.clone();
            let filter = match i % 3 {
                0 => FilterCriteria::default(),
                1 => FilterCriteria::new(Strength::Moderate).with_symbol(SYMBOLS[i % SYMBOLS.len()]),
                _ => FilterCriteria::new(Strength::Strong).with_side(Side::Buy),
            };
            router.subscribe(filter, move |_| {
                counter.fetch_add(1, Ordering::Relaxed);
            });
        }

        group.bench_with_input(
            BenchmarkId::from_parameter(subscribers),
            &subscribers,
            |b, _| b.iter(|| router.on_batch(black_box(batch.clone()))),
        );
    }
    group.finish();
}

criterion_group!(benches, bench_fanout);
criterion_main!(benches);
