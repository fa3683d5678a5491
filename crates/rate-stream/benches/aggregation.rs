use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use rust_decimal::Decimal;

use fx_core::{BaselineWindow, Quote};
use fx_rate_stream::{ActiveRateTable, BaselineResolver, MemoryQuoteStore, QuoteAggregator};

const SYMBOLS: [&str; 5] = ["EURUSD", "NZDUSD", "AUDUSD", "EURGBP", "GBPUSD"];

fn quotes(n: usize) -> Vec<Quote> {
    (0..n)
        .map(|i| {
            Quote::new(
                SYMBOLS[i % SYMBOLS.len()],
                Decimal::new(120_000_000 + (i as i64 % 1_000), 8),
                i as i64,
                i as u64,
            )
        })
        .collect()
}

fn aggregator() -> QuoteAggregator {
    let baselines = Arc::new(BaselineResolver::new(Arc::new(MemoryQuoteStore::default())));
    let window = BaselineWindow::new(-1_000, -1).unwrap();
    baselines.load_from(
        SYMBOLS
            .iter()
            .enumerate()
            .map(|(i, s)| Quote::new(*s, Decimal::new(12, 1), -10, i as u64)),
        window,
    );
    QuoteAggregator::new(Arc::new(ActiveRateTable::new()), baselines)
}

fn bench_process(c: &mut Criterion) {
    let input = quotes(10_000);

    c.bench_function("process_10k_quotes", |b| {
        b.iter_batched(
            aggregator,
            |agg| {
                for quote in input.iter().cloned() {
                    let _ = black_box(agg.process(quote));
                }
            },
            BatchSize::SmallInput,
        )
    });
}

criterion_group!(benches, bench_process);
criterion_main!(benches);
