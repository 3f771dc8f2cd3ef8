use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use gordb::{
    BucketConfig, DictionaryTable, EngineConfig, GenomicIterator, GenomicRange, LockConfig,
    PackLevel, QueryOptions, Result, Session, TableFilter,
};

const CHROMS: [&str; 3] = ["chr1", "chr2", "chr10"];

fn session(bucket_size: usize) -> Session {
    Session::new(
        EngineConfig::new()
            .bucket(BucketConfig::default().bucket_size(bucket_size))
            .lock(LockConfig::default().timeout(Duration::from_secs(5))),
    )
    .unwrap()
}

/// Writes `n` sample files with rows on every chromosome and a dictionary
/// listing them.
fn write_table(dir: &Path, n: usize) -> PathBuf {
    let mut dict = String::from("## COLUMNS = Chrom,Pos,Ref,Alt\n");
    for i in 1..=n {
        let mut body = String::from("Chrom\tPos\tRef\tAlt\n");
        for chr in CHROMS {
            for pos in [i as u32 * 10, 1000] {
                body.push_str(&format!("{chr}\t{pos}\tA\tpn{i}\n"));
            }
        }
        fs::write(dir.join(format!("pn{i}.gor")), body).unwrap();
        dict.push_str(&format!("pn{i}.gor\tpn{i}\n"));
    }
    let path = dir.join("variants.gord");
    fs::write(&path, dict).unwrap();
    path
}

fn read(session: &Session, table: &Path, filters: &[TableFilter], source: bool) -> Vec<String> {
    let table = session.load_table(table).unwrap();
    session
        .open_table(&table, filters, QueryOptions::new().insert_source(source))
        .unwrap()
        .map(|row| row.map(|r| r.to_string()))
        .collect::<Result<_>>()
        .unwrap()
}

#[test]
fn bucketizing_does_not_change_query_results() {
    let dir = tempfile::tempdir().unwrap();
    let table = write_table(dir.path(), 7);
    let session = session(3);

    let tags = TableFilter::new().tag_list("pn2,pn5,pn7").unwrap();
    let all_before = read(&session, &table, &[], true);
    let plain_before = read(&session, &table, &[], false);
    let tagged_before = read(&session, &table, &[tags.clone()], true);
    assert_eq!(all_before.len(), 7 * CHROMS.len() * 2);

    let created = session
        .bucket_manager()
        .bucketize(&table, PackLevel::NoPacking, 0)
        .unwrap();
    assert_eq!(created, 3);
    let loaded = DictionaryTable::load(&table).unwrap();
    assert_eq!(loaded.serial(), 3);
    assert_eq!(loaded.columns().unwrap().to_string(), "Chrom\tPos\tRef\tAlt");

    assert_eq!(read(&session, &table, &[], true), all_before);
    assert_eq!(read(&session, &table, &[], false), plain_before);
    assert_eq!(read(&session, &table, &[tags], true), tagged_before);

    // chr2 sorts before chr10.
    let chroms: Vec<&str> = all_before.iter().map(|l| l.split('\t').next().unwrap()).collect();
    let first_chr10 = chroms.iter().position(|c| *c == "chr10").unwrap();
    assert!(chroms[..first_chr10].iter().all(|c| *c != "chr10"));
    assert!(chroms[first_chr10..].iter().all(|c| *c == "chr10"));
}

#[test]
fn readers_keep_their_snapshot_while_bucketizing() {
    let dir = tempfile::tempdir().unwrap();
    let table = write_table(dir.path(), 4);
    let session = session(2);
    let expected = read(&session, &table, &[], true);

    let snapshot = session.load_table(&table).unwrap();
    let mut reader = session
        .open_table(&snapshot, &[], QueryOptions::new().insert_source(true))
        .unwrap();
    let first = reader.next().unwrap().unwrap().to_string();

    session
        .bucket_manager()
        .bucketize(&table, PackLevel::NoPacking, 0)
        .unwrap();

    let mut rows = vec![first];
    for row in reader {
        rows.push(row.unwrap().to_string());
    }
    assert_eq!(rows, expected);
}

#[test]
fn seek_into_bucketized_table() {
    let dir = tempfile::tempdir().unwrap();
    let table = write_table(dir.path(), 5);
    let session = session(5);
    session
        .bucket_manager()
        .bucketize(&table, PackLevel::NoPacking, 0)
        .unwrap();

    let all = read(&session, &table, &[], true);
    let loaded = session.load_table(&table).unwrap();
    let mut merge = session
        .open_table(&loaded, &[], QueryOptions::new().insert_source(true))
        .unwrap();
    assert!(merge.seek("chr2", 30).unwrap());

    let mut suffix = Vec::new();
    while merge.has_next().unwrap() {
        suffix.push(merge.next_data().unwrap().to_string());
    }
    let start = all.iter().position(|l| l.starts_with("chr2\t30\t")).unwrap();
    assert_eq!(suffix, all[start..].to_vec());
    merge.close().unwrap();
}

#[test]
fn range_filter_selects_split_entries() {
    let dir = tempfile::tempdir().unwrap();
    let session = session(10);
    fs::write(
        dir.path().join("whole.gor"),
        "Chrom\tPos\tV\nchr1\t5\ta\nchr1\t500\tb\nchr2\t5\tc\n",
    )
    .unwrap();
    let dict = dir.path().join("split.gord");
    fs::write(
        &dict,
        "whole.gor\tpart\tchr2\t0\tchr2\t100\n\
         whole.gor\tpart\tchr1\t0\tchr1\t100\n\
         whole.gor\tpart\tchr1\t101\tchr1\t1000\n",
    )
    .unwrap();

    assert_eq!(
        read(&session, &dict, &[], false),
        vec!["chr1\t5\ta", "chr1\t500\tb", "chr2\t5\tc"]
    );
    let chr1 = TableFilter::new().range(GenomicRange::chromosome("chr1"));
    assert_eq!(read(&session, &dict, &[chr1], false), vec!["chr1\t5\ta", "chr1\t500\tb"]);
}
