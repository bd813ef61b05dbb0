use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rand::{rngs::StdRng, Rng, SeedableRng};

use tacplane::identity::cache::fingerprint;
use tacplane::identity::{is_authorized, privilege_of};

const VERBS: &[&str] = &["show", "SHOW", "ping", "configure", "reload", "traceroute", "write", "ssh", "copy", "debug"];
const ROLE_SETS: &[&[&str]] = &[
    &["viewer"],
    &["network-user"],
    &["admin"],
    &["guest", "auditor", "network-readonly"],
    &["guest", "auditor", "contractor", "temp"],
];

fn gen_commands(n: usize, seed: u64) -> Vec<String> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n)
        .map(|_| {
            let verb = VERBS[rng.gen_range(0..VERBS.len())];
            format!("{} interface {}/{}", verb, rng.gen_range(0..4), rng.gen_range(0..48))
        })
        .collect()
}

fn bench_policy(c: &mut Criterion) {
    let n = 10_000usize;
    let commands = gen_commands(n, 0xBEEF_CAFE);
    let mut group = c.benchmark_group("policy");
    group.throughput(Throughput::Elements(n as u64));

    for roles in ROLE_SETS {
        let label = roles.join(",");
        group.bench_with_input(BenchmarkId::new("privilege_of", &label), roles, |b, roles| {
            b.iter(|| criterion::black_box(privilege_of(*roles)));
        });
        group.bench_with_input(BenchmarkId::new("is_authorized", &label), roles, |b, roles| {
            b.iter(|| {
                let allowed = commands.iter().filter(|c| is_authorized(*roles, c)).count();
                criterion::black_box(allowed);
            });
        });
    }
    group.finish();
}

fn bench_fingerprint(c: &mut Criterion) {
    let mut rng = StdRng::seed_from_u64(0xDEAD_BEEF);
    let creds: Vec<(String, String)> = (0..1_000)
        .map(|i| (format!("user{}", i), (0..16).map(|_| rng.gen_range(b'a'..=b'z') as char).collect()))
        .collect();
    let mut group = c.benchmark_group("cache");
    group.throughput(Throughput::Elements(creds.len() as u64));
    group.bench_function("fingerprint", |b| {
        b.iter(|| {
            for (p, s) in &creds {
                criterion::black_box(fingerprint(p, s));
            }
        });
    });
    group.finish();
}

criterion_group!(benches, bench_policy, bench_fingerprint);
criterion_main!(benches);
