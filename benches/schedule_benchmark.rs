use chrono::{NaiveTime, TimeZone, Utc, Weekday};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use replica_backup::schedule::{check_for_missed_backup, next_due_time};
use replica_backup::{
    BackupMetadata, BackupPolicy, BackupSchedule, BackupStoreInformation, FrequencyInterval,
    RecoveryPointInformation,
};
use uuid::Uuid;

fn store() -> BackupStoreInformation {
    BackupStoreInformation::FileShare {
        path: "/mnt/backups".into(),
    }
}

fn record(schedule: BackupSchedule) -> BackupMetadata {
    let policy = BackupPolicy::new("bench", schedule, 10, store());
    let mut metadata = BackupMetadata::new(Uuid::new_v4(), Some(policy));
    let id = Uuid::new_v4();
    metadata.last_recovery_point = Some(RecoveryPointInformation {
        location: "app/svc/partition/2024-01-01 00.00.00.tgz".into(),
        backup_time: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        backup_id: id,
        backup_chain_id: id,
        backup_index: 0,
    });
    metadata.number_of_backups_in_chain = 1;
    metadata
}

fn weekly() -> BackupSchedule {
    BackupSchedule::Weekly {
        run_days: vec![Weekday::Mon, Weekday::Thu],
        run_times: (0..24).map(|h| NaiveTime::from_hms_opt(h, 30, 0).unwrap()).collect(),
    }
}

fn schedule_benchmark(c: &mut Criterion) {
    let now = Utc.with_ymd_and_hms(2024, 6, 15, 13, 45, 0).unwrap();
    let frequency = record(BackupSchedule::Frequency {
        interval: FrequencyInterval::Minutes(15),
    });
    let weekly = record(weekly());

    c.bench_function("next_due_time_frequency", |b| {
        b.iter(|| next_due_time(black_box(&frequency), black_box(now), false))
    });

    c.bench_function("next_due_time_weekly", |b| {
        b.iter(|| next_due_time(black_box(&weekly), black_box(now), false))
    });

    c.bench_function("check_for_missed_backup_weekly", |b| {
        b.iter(|| check_for_missed_backup(black_box(&weekly), black_box(now)))
    });
}

fn metadata_benchmark(c: &mut Criterion) {
    let metadata = record(weekly());
    let bytes = metadata.serialize().unwrap();

    c.bench_function("metadata_serialize", |b| {
        b.iter(|| black_box(&metadata).serialize().unwrap())
    });

    c.bench_function("metadata_deserialize", |b| {
        b.iter(|| BackupMetadata::deserialize(black_box(&bytes)).unwrap())
    });
}

criterion_group!(benches, schedule_benchmark, metadata_benchmark);
criterion_main!(benches);
