use cashcard_core::memory::MemoryStore;
use cashcard_core::{
    CardId, Identity, LifecycleEngine, PageSpec, Role, SortDirection, SortKey, SortSpec,
};
use criterion::{black_box, criterion_group, criterion_main, Criterion};

fn seeded_engine(cards_per_owner: usize) -> LifecycleEngine<MemoryStore> {
    let mut engine = LifecycleEngine::new(MemoryStore::default());
    let sarah = Identity::new("sarah", [Role::CardOwner]);
    let kumar = Identity::new("kumar", [Role::CardOwner]);
    for index in 0..cards_per_owner {
        #[allow(clippy::cast_precision_loss)]
        let amount = (index as f64) * 1.25;
        let _ = engine.create(&sarah, amount);
        let _ = engine.create(&kumar, amount);
    }
    engine
}

fn bench_list(c: &mut Criterion) {
    let sarah = Identity::new("sarah", [Role::CardOwner]);
    let page = PageSpec::default();
    let sort = SortSpec::default();

    c.bench_function("list_1k_cards_default_sort", |b| {
        let mut engine = seeded_engine(1_000);
        b.iter(|| {
            let cards = engine.list(black_box(&sarah), &page, &sort);
            black_box(cards)
        });
    });

    c.bench_function("list_1k_cards_desc_amount", |b| {
        let mut engine = seeded_engine(1_000);
        let desc = SortSpec { key: SortKey::Amount, direction: SortDirection::Desc };
        b.iter(|| {
            let cards = engine.list(black_box(&sarah), &page, &desc);
            black_box(cards)
        });
    });
}

fn bench_create_and_get(c: &mut Criterion) {
    let sarah = Identity::new("sarah", [Role::CardOwner]);

    c.bench_function("create_card", |b| {
        let mut engine = seeded_engine(100);
        b.iter(|| {
            let card = engine.create(black_box(&sarah), 123.45);
            black_box(card)
        });
    });

    c.bench_function("get_card_hot", |b| {
        let mut engine = seeded_engine(100);
        let id = match engine.create(&sarah, 1.0) {
            Ok(card) => card.id,
            Err(_) => CardId::new(),
        };
        b.iter(|| {
            let card = engine.get(black_box(&sarah), id);
            black_box(card)
        });
    });
}

criterion_group!(benches, bench_list, bench_create_and_get);
criterion_main!(benches);
