use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use order_matcher::{Order, OrderBookIndex, Side};

fn create_test_order(id: u64, side: &str, price: i64) -> Order {
    match Order::new(id, side, price, 10) {
        Ok(order) => order,
        Err(err) => panic!("bench order must be valid: {}", err),
    }
}

fn filled_book(depth: u64) -> OrderBookIndex {
    let book = OrderBookIndex::new();
    for id in 0..depth {
        let side = if id % 2 == 0 { "buy" } else { "sell" };
        book.insert(&create_test_order(id, side, 1 + (id % 100) as i64));
    }
    book
}

fn order_book_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("order_book_index");

    // Benchmark inserting orders into a growing book
    group.bench_function("insert", |b| {
        let book = OrderBookIndex::new();
        let mut id = 0u64;
        b.iter(|| {
            id += 1;
            book.insert(black_box(&create_test_order(id, "buy", (id % 100) as i64 + 1)));
        });
    });

    // Benchmark best price lookups at several depths
    for depth in [100u64, 10_000] {
        let book = filled_book(depth);
        group.bench_with_input(BenchmarkId::new("peek_best", depth), &book, |b, book| {
            b.iter(|| {
                black_box(book.peek_best(black_box(Side::Buy)));
                black_box(book.peek_best(black_box(Side::Sell)));
            });
        });
    }

    // Benchmark insert then remove of the best order
    group.bench_function("insert_remove_best", |b| {
        let book = filled_book(10_000);
        let mut id = 1_000_000u64;
        b.iter(|| {
            id += 1;
            book.insert(&create_test_order(id, "sell", 1));
            black_box(book.remove(black_box(id)));
        });
    });

    group.finish();
}

criterion_group!(benches, order_book_benchmark);
criterion_main!(benches);
