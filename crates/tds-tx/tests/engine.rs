//! End-to-end pipelines over real stream files: file sources and sinks,
//! the external sort, the merge driver, group-by, and the codec round-trip.

use std::path::PathBuf;

use tokio_util::sync::CancellationToken;

use tds_core::{KeySpec, Pipeline, Provenance, ReducerSpec};
use tds_io::{tmpfiles, FileSink, FileSource};
use tds_tx::{CatSource, GroupBy, MergeDriver, Removal, Sort, SpecFactory};

async fn write_stream(lines: &[&str]) -> PathBuf {
    let path = tmpfiles::create("e2e").unwrap();
    tokio::fs::write(&path, format!("{}\n", lines.join("\n")))
        .await
        .unwrap();
    path
}

async fn read_lines(path: &PathBuf) -> Vec<String> {
    let text = tokio::fs::read_to_string(path).await.unwrap();
    text.lines().map(str::to_string).collect()
}

/// Data lines only: no header, no comments.
fn data(lines: &[String]) -> Vec<&str> {
    lines
        .iter()
        .map(String::as_str)
        .filter(|l| !l.starts_with('#'))
        .collect()
}

#[tokio::test]
async fn sort_pipeline_over_files() {
    let input = write_stream(&["#tds cid cname", "11\tnumanal", "10\tpascal"]).await;
    let output = tmpfiles::create("e2e").unwrap();

    let sort = Sort::new(KeySpec::parse(["-n", "cid"]).unwrap());
    Pipeline::new(
        Box::new(FileSource::path(&input)),
        Box::new(FileSink::path(&output)),
    )
    .filter(Box::new(sort))
    .run()
    .await
    .unwrap();

    let lines = read_lines(&output).await;
    assert_eq!(lines[0], "#tds cid cname");
    assert_eq!(data(&lines), ["10\tpascal", "11\tnumanal"]);
    // The sort appended its provenance comment.
    assert!(lines.iter().any(|l| l.starts_with("# | sort")));

    tmpfiles::release(&input);
    tmpfiles::release(&output);
}

#[tokio::test]
async fn merge_two_sorted_files_by_name() {
    // Both inputs are sorted by cname, not cid.
    let sorted_a = write_stream(&["#tds cid cname", "11\tnumanal", "10\tpascal"]).await;
    let sorted_b = write_stream(&["#tds cid cname", "12\tos", "13\tstatistics"]).await;
    let output = tmpfiles::create("e2e").unwrap();
    let (tx, mut rx) = tds_core::pipe();
    let driver = MergeDriver::new(KeySpec::lexical("cname"))
        .provenance(Provenance::new("merge cname"));
    let sink = async {
        use tds_core::Sink;
        let mut sink = FileSink::path(&output);
        sink.run(&mut rx, CancellationToken::new()).await
    };
    let run = driver.merge_files(
        vec![sorted_a.clone(), sorted_b.clone()],
        Removal::Keep,
        tx,
        CancellationToken::new(),
    );
    let (merge_result, sink_result) = tokio::join!(run, sink);
    merge_result.unwrap();
    sink_result.unwrap();

    let lines = read_lines(&output).await;
    assert_eq!(
        data(&lines),
        ["11\tnumanal", "12\tos", "10\tpascal", "13\tstatistics"]
    );

    tmpfiles::release(&sorted_a);
    tmpfiles::release(&sorted_b);
    tmpfiles::release(&output);
}

#[tokio::test]
async fn groupby_pipeline_with_unsorted_input() {
    let input = write_stream(&[
        "#tds event",
        "B", "A", "B", "A", "B", "A", "B", "A", "B", "A", "B", "A",
    ])
    .await;
    let output = tmpfiles::create("e2e").unwrap();

    // Unsorted input goes through a transparent sort on the group key.
    let sort = Sort::new(KeySpec::lexical("event")).provenance(Provenance::disabled("sort"));
    let groupby = GroupBy::new(
        "event",
        Box::new(SpecFactory::new(ReducerSpec::Count)),
    );
    Pipeline::new(
        Box::new(FileSource::path(&input)),
        Box::new(FileSink::path(&output)),
    )
    .filter(Box::new(sort))
    .filter(Box::new(groupby))
    .run()
    .await
    .unwrap();

    let lines = read_lines(&output).await;
    assert_eq!(lines[0], "#tds event n");
    assert_eq!(data(&lines), ["A\t6", "B\t6"]);

    tmpfiles::release(&input);
    tmpfiles::release(&output);
}

#[tokio::test]
async fn copy_round_trips_rows_and_comments() {
    let input = write_stream(&[
        "#tds -F C cid cname",
        "10,pascal",
        "# midstream comment",
        "11,-",
    ])
    .await;
    let output = tmpfiles::create("e2e").unwrap();

    Pipeline::new(
        Box::new(FileSource::path(&input)),
        Box::new(FileSink::path(&output)),
    )
    .run()
    .await
    .unwrap();

    assert_eq!(read_lines(&output).await, read_lines(&input).await);

    tmpfiles::release(&input);
    tmpfiles::release(&output);
}

#[tokio::test]
async fn comment_only_stream_is_preserved() {
    let input = write_stream(&["#tds k", "# only a comment"]).await;
    let output = tmpfiles::create("e2e").unwrap();

    let sort = Sort::new(KeySpec::lexical("k")).provenance(Provenance::disabled("sort"));
    Pipeline::new(
        Box::new(FileSource::path(&input)),
        Box::new(FileSink::path(&output)),
    )
    .filter(Box::new(sort))
    .run()
    .await
    .unwrap();

    let lines = read_lines(&output).await;
    assert_eq!(lines, ["#tds k", "# only a comment"]);

    tmpfiles::release(&input);
    tmpfiles::release(&output);
}

#[tokio::test]
async fn cat_then_sort_spilling_to_disk() {
    let a = write_stream(&["#tds k v", "3\tc", "1\ta"]).await;
    let b = write_stream(&["#tds k v", "4\td", "2\tb"]).await;
    let output = tmpfiles::create("e2e").unwrap();

    let sort = Sort::new(KeySpec::parse(["-n", "k"]).unwrap())
        .run_limit(1)
        .provenance(Provenance::disabled("sort"));
    Pipeline::new(
        Box::new(CatSource::new(vec![a.clone(), b.clone()]).provenance(Provenance::disabled("cat"))),
        Box::new(FileSink::path(&output)),
    )
    .filter(Box::new(sort))
    .run()
    .await
    .unwrap();

    let lines = read_lines(&output).await;
    assert_eq!(data(&lines), ["1\ta", "2\tb", "3\tc", "4\td"]);

    tmpfiles::release(&a);
    tmpfiles::release(&b);
    tmpfiles::release(&output);
}

#[test]
fn reducer_spec_loads_from_yaml() {
    let spec: ReducerSpec = serde_yaml::from_str("type: mean\ncolumn: delay\n").unwrap();
    assert_eq!(spec.describe(), "mean:delay");
    assert!(serde_yaml::from_str::<ReducerSpec>("type: median\n").is_err());
}

#[tokio::test]
async fn safing_keeps_arity_through_a_separator_change() {
    // Group means come back space-free even though the reducer thinks in
    // the default separator while the stream is comma-separated.
    let input = write_stream(&["#tds -F C g x", "G1,1", "G1,1", "G2,3"]).await;
    let output = tmpfiles::create("e2e").unwrap();

    let groupby = GroupBy::new(
        "g",
        Box::new(SpecFactory::new(ReducerSpec::Mean {
            column: "x".into(),
        })),
    );
    Pipeline::new(
        Box::new(FileSource::path(&input)),
        Box::new(FileSink::path(&output)),
    )
    .filter(Box::new(groupby))
    .run()
    .await
    .unwrap();

    let lines = read_lines(&output).await;
    assert_eq!(lines[0], "#tds -F C g mean n");
    assert_eq!(data(&lines), ["G1,1,2", "G2,3,1"]);

    tmpfiles::release(&input);
    tmpfiles::release(&output);
}
