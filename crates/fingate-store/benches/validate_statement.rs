use std::env;
use std::time::Duration;

use chrono::NaiveDate;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use fingate_store::{Catalog, KnownSchema, Validator};
use fingate_types::JsonMap;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde_json::json;

const SEED: u64 = 0x5eed_f17a;

const COLUMNS: &[&str] = &["id", "transaction_date", "description", "amount", "category_id", "person_id"];
const TABLES: &[&str] = &["transactions", "persons", "spending_categories", "account_type"];
const HOSTILE: &[&str] = &[
    "DELETE FROM budget_app.transactions",
    "SELECT 1; DROP TABLE budget_app.transactions",
    "SELECT pg_terminate_backend(pid) FROM pg_stat_activity",
    "SELECT * FROM pg_catalog.pg_authid",
    "UPDATE budget_app.persons SET name = 'x'",
];

#[derive(Clone, Copy, Debug)]
struct Workload {
    statements: usize,
    joins: usize,
}

impl Workload {
    fn label(&self) -> String {
        format!("statements{}_joins{}", self.statements, self.joins)
    }
}

fn random_select(rng: &mut StdRng, joins: usize) -> String {
    let table = TABLES.choose(rng).copied().unwrap_or("transactions");
    let mut sql = format!("SELECT t0.{} FROM budget_app.{} t0", COLUMNS[rng.gen_range(0..COLUMNS.len())], table);
    for idx in 1..=joins {
        let joined = TABLES.choose(rng).copied().unwrap_or("persons");
        sql.push_str(&format!(" JOIN budget_app.{joined} t{idx} ON t{idx}.id = t0.id"));
    }
    sql.push_str(&format!(
        " WHERE t0.id > {} AND t0.description <> 'drop -- {}' ORDER BY 1 LIMIT {}",
        rng.gen_range(0..10_000),
        rng.gen_range(0..100),
        rng.gen_range(1..500)
    ));
    sql
}

fn statements(size: Workload) -> Vec<String> {
    let mut rng = StdRng::seed_from_u64(SEED);
    (0..size.statements)
        .map(|idx| {
            if idx % 5 == 0 {
                HOSTILE[rng.gen_range(0..HOSTILE.len())].to_string()
            } else {
                random_select(&mut rng, size.joins)
            }
        })
        .collect()
}

fn validate_statement_bench(c: &mut Criterion) {
    let mut group = c.benchmark_group("validate_statement");
    group.sample_size(25);
    group.warm_up_time(Duration::from_secs(2));
    group.measurement_time(Duration::from_secs(5));

    let mut sizes = vec![
        Workload { statements: 100, joins: 0 },
        Workload { statements: 100, joins: 3 },
    ];
    if is_extended() {
        sizes.push(Workload { statements: 1_000, joins: 8 });
    }

    let plain = Validator::new();
    let scoped = Validator::with_schema(KnownSchema::finance());
    for size in sizes {
        let batch = statements(size);
        group.throughput(Throughput::Elements(batch.len() as u64));
        group.bench_with_input(BenchmarkId::new("tokens_only", size.label()), &batch, |b, batch| {
            b.iter(|| {
                for sql in batch {
                    black_box(plain.validate(sql));
                }
            })
        });
        group.bench_with_input(BenchmarkId::new("with_schema", size.label()), &batch, |b, batch| {
            b.iter(|| {
                for sql in batch {
                    black_box(scoped.validate(sql));
                }
            })
        });
    }
    group.finish();

    let catalog = match Catalog::finance() {
        Ok(catalog) => catalog,
        Err(err) => panic!("finance catalog is invalid: {err}"),
    };
    let today = NaiveDate::from_ymd_opt(2024, 5, 17).unwrap_or_default();
    let mut params = JsonMap::new();
    params.insert("category".to_string(), json!("Groceries"));
    params.insert("min_amount".to_string(), json!(10));
    params.insert("limit".to_string(), json!("50"));

    let mut prepare_group = c.benchmark_group("prepare_template");
    prepare_group.sample_size(25);
    prepare_group.bench_function("get_recent_transactions", |b| {
        b.iter(|| black_box(catalog.prepare("get_recent_transactions", &params, today)))
    });
    prepare_group.finish();
}

fn is_extended() -> bool {
    matches!(
        env::var("FINGATE_BENCH_EXTENDED").as_deref(),
        Ok("1") | Ok("true") | Ok("TRUE")
    )
}

criterion_group!(benches, validate_statement_bench);
criterion_main!(benches);
