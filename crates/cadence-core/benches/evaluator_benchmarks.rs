use cadence_core::recurrence::{DayConstraint, RecurrenceRule, ScheduleEvaluator};
use chrono::{DateTime, Duration, TimeZone, Utc, Weekday};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

fn anchor() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 6, 9, 0, 0).unwrap()
}

fn rules() -> Vec<(&'static str, RecurrenceRule)> {
    vec![
        ("daily", RecurrenceRule::daily(anchor(), "UTC")),
        ("weekly_berlin", RecurrenceRule::weekly(anchor(), "Europe/Berlin").every(2)),
        ("monthly_31st", RecurrenceRule::monthly(Utc.with_ymd_and_hms(2025, 1, 31, 9, 0, 0).unwrap(), "UTC")),
        (
            "weekdays",
            RecurrenceRule::weekly(anchor(), "America/New_York").with_constraint(DayConstraint::Weekdays {
                days: vec![Weekday::Mon, Weekday::Wed, Weekday::Fri],
            }),
        ),
        (
            "last_business_day",
            RecurrenceRule::monthly(anchor(), "UTC").with_constraint(DayConstraint::LastBusinessDay),
        ),
    ]
}

fn bench_compute_next_run(c: &mut Criterion) {
    let evaluator = ScheduleEvaluator::default();
    let mut group = c.benchmark_group("compute_next_run");

    for (name, rule) in rules() {
        let after = anchor() + Duration::days(400);
        group.bench_with_input(BenchmarkId::from_parameter(name), &rule, |b, rule| {
            b.iter(|| evaluator.compute_next_run(black_box(rule), black_box(after)))
        });
    }
    group.finish();
}

fn bench_preview(c: &mut Criterion) {
    let evaluator = ScheduleEvaluator::default();
    let mut group = c.benchmark_group("preview");

    for count in [10usize, 100] {
        let rule = RecurrenceRule::weekly(anchor(), "Europe/Berlin").with_constraint(DayConstraint::Weekdays {
            days: vec![Weekday::Tue, Weekday::Thu],
        });
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            b.iter(|| evaluator.preview(black_box(&rule), anchor(), count))
        });
    }
    group.finish();
}

fn bench_validate(c: &mut Criterion) {
    let evaluator = ScheduleEvaluator::default();
    let rule = RecurrenceRule::monthly(anchor(), "Asia/Tokyo").with_constraint(DayConstraint::NthWeekday {
        n: -1,
        weekday: Weekday::Fri,
    });

    c.bench_function("validate_nth_weekday", |b| b.iter(|| evaluator.validate(black_box(&rule))));
}

criterion_group!(benches, bench_compute_next_run, bench_preview, bench_validate);
criterion_main!(benches);
