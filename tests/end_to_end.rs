//! End-to-end scenarios through the public engine API.

use pretty_assertions::assert_eq;

use xena_store::loader::source::InMemoryMatrix;
use xena_store::query::ast::{col, Direction, Select, Value};
use xena_store::{sources, DatasetMeta, Db, FetchRequest, LoadRequest};

fn names_of(rows: &[xena_store::query::ast::Row], column: &str) -> Vec<String> {
    rows.iter()
        .map(|row| match &row[column] {
            Value::Text(t) => t.clone(),
            other => panic!("expected text, got {:?}", other),
        })
        .collect()
}

fn load_file(db: &Db, path: &std::path::Path, probemap: bool) -> xena_store::LoadSummary {
    let detected = sources::detect(path, probemap).unwrap();
    db.write_matrix(LoadRequest {
        dataset: path.file_name().unwrap().to_str().unwrap().to_string(),
        sources: detected.sources,
        metadata: detected.metadata,
        matrix: detected.reader,
        features: None,
        force: false,
    })
    .unwrap()
}

fn count_rows(db: &Db, table: &str) -> i64 {
    let q = Select::default()
        .item(
            xena_store::query::ast::Expr::Call {
                func: "count".into(),
                args: vec![xena_store::query::ast::Expr::All],
            },
            Some("n"),
        )
        .from_table(table);
    match db.run_query(&q).unwrap()[0]["n"] {
        Value::Integer(n) => n,
        ref other => panic!("expected integer, got {:?}", other),
    }
}

/// Scenario: load an in-memory matrix, list datasets and fields.
#[test]
fn in_memory_matrix_and_probe_list() {
    let db = Db::open_in_memory().unwrap();
    db.write_matrix(LoadRequest {
        dataset: "id1".into(),
        sources: vec![],
        metadata: DatasetMeta::default(),
        matrix: Box::new(InMemoryMatrix::from_scores(vec![
            ("probe1", vec![1.1, 1.2]),
            ("probe2", vec![2.1, 2.2]),
        ])),
        features: None,
        force: false,
    })
    .unwrap();

    let datasets = db
        .run_query(&Select::default().column("name").from_table("dataset"))
        .unwrap();
    assert_eq!(names_of(&datasets, "name"), vec!["id1"]);

    let fields = db
        .run_query(
            &Select::default()
                .column("name")
                .from_table("field")
                .order_by(col("id"), Direction::Asc),
        )
        .unwrap();
    assert_eq!(names_of(&fields, "name"), vec!["probe1", "probe2"]);
}

/// Scenario: load a plain genomic matrix TSV.
#[test]
fn tsv_matrix_file() {
    let tmp = temp_testdir::TempDir::default();
    let path = tmp.join("matrix.tsv");
    let mut text = String::from("probe\ts1\ts2\ts3\ts4\n");
    for p in 1..=5 {
        text.push_str(&format!("p{p}\t{p}.1\t{p}.2\t{p}.3\t{p}.4\n"));
    }
    std::fs::write(&path, text).unwrap();

    let db = Db::open_in_memory().unwrap();
    let summary = load_file(&db, &path, false);

    // Stored rows are the 4 samples; fields are the 5 probes plus the
    // synthesized sampleID column with one code per sample.
    assert_eq!(summary.rows, 4);
    assert_eq!(count_rows(&db, "field"), 6);
    assert_eq!(count_rows(&db, "code"), 4);

    let rows = db
        .run_query(&Select::default().column("rows").from_table("dataset"))
        .unwrap();
    assert_eq!(rows[0]["rows"], Value::Integer(4));
}

/// Scenario: the same matrix with a cgdata JSON sidecar.
#[test]
fn cgdata_genomic_matrix() {
    let tmp = temp_testdir::TempDir::default();
    let path = tmp.join("expression");
    std::fs::write(&path, "probe\ts1\ts2\np1\t1.5\t2.5\np2\t3.5\t4.5\n").unwrap();
    std::fs::write(
        tmp.join("expression.json"),
        r#"{"type": "genomicMatrix", "cohort": "TCGA", "shortTitle": "expr"}"#,
    )
    .unwrap();

    let db = Db::open_in_memory().unwrap();
    let detected = sources::detect(&path, false).unwrap();
    assert_eq!(detected.kind, sources::FileKind::GenomicMatrix);
    assert_eq!(detected.sources.len(), 2);
    let summary = load_file(&db, &path, false);
    assert_eq!(summary.rows, 2);

    let rows = db
        .run_query(
            &Select::default()
                .column("cohort")
                .column("shorttitle")
                .from_table("dataset"),
        )
        .unwrap();
    assert_eq!(rows[0]["cohort"], Value::Text("TCGA".into()));
    assert_eq!(rows[0]["shorttitle"], Value::Text("expr".into()));
}

/// Scenario: load a nine-row probemap.
#[test]
fn probemap_load() {
    let tmp = temp_testdir::TempDir::default();
    let path = tmp.join("probes.tsv");
    let mut text = String::new();
    for p in 0..9 {
        text.push_str(&format!(
            "probe{p}\tGENE{p},ALT{p}\tchr1\t{}\t{}\t+\n",
            p * 10_000,
            p * 10_000 + 5_000
        ));
    }
    std::fs::write(&path, text).unwrap();

    let db = Db::open_in_memory().unwrap();
    let summary = load_file(&db, &path, true);
    assert_eq!(summary.rows, 9);

    assert_eq!(count_rows(&db, "field_position"), 9);
    assert_eq!(count_rows(&db, "field_gene"), 18);
    assert_eq!(count_rows(&db, "code"), 9);

    // Bin-indexed interval lookup resolves probe names.
    let hits = db
        .probes_in_range("probes.tsv", "chr1", 0, 15_000)
        .unwrap();
    assert_eq!(hits, vec!["probe0", "probe1"]);
}

/// Scenario: load a clinical matrix with categorical features.
#[test]
fn clinical_matrix() {
    let tmp = temp_testdir::TempDir::default();
    let path = tmp.join("clinical.tsv");
    std::fs::write(
        &path,
        "sample\tage\tstage\tsmoker\tweight\n\
         s1\t61\tII\tyes\t70.5\n\
         s2\t55\tIII\tno\t81\n\
         s3\t47\tII\tyes\t64\n\
         s4\t72\tIV\tno\t77\n\
         s5\t58\tII\tyes\t69\n",
    )
    .unwrap();
    std::fs::write(tmp.join("clinical.tsv.json"), r#"{"type": "clinicalMatrix"}"#).unwrap();

    let db = Db::open_in_memory().unwrap();
    let summary = load_file(&db, &path, false);
    assert_eq!(summary.rows, 5);
    // sampleID + 4 features.
    assert_eq!(count_rows(&db, "field"), 5);

    // stage has three distinct values coded in first-seen order; the
    // fetch surfaces both orderings and dictionary.
    let results = db
        .fetch(vec![FetchRequest {
            dataset: "clinical.tsv".into(),
            columns: vec!["stage".into(), "age".into()],
            samples: vec!["s1".into(), "s2".into(), "s4".into()],
        }])
        .unwrap();
    let result = &results[0];
    assert_eq!(result.data["stage"], vec![0.0, 1.0, 2.0]);
    assert_eq!(result.codes["stage"], vec!["II", "III", "IV"]);
    assert_eq!(result.data["age"], vec![61.0, 55.0, 72.0]);
    assert!(!result.codes.contains_key("age"));
}

/// Scenario: fetch scattered samples from a ten-sample dataset.
#[test]
fn fetch_scattered_samples() {
    let tmp = temp_testdir::TempDir::default();
    let path = tmp.join("wide.tsv");
    let mut text = String::from("probe");
    for s in 1..=10 {
        text.push_str(&format!("\tsample{s}"));
    }
    text.push('\n');
    for p in 1..=2 {
        text.push_str(&format!("probe{p}"));
        for s in 1..=10 {
            text.push_str(&format!("\t{}.{}", s, p));
        }
        text.push('\n');
    }
    std::fs::write(&path, text).unwrap();

    let db = Db::open_in_memory().unwrap();
    load_file(&db, &path, false);

    let results = db
        .fetch(vec![FetchRequest {
            dataset: "wide.tsv".into(),
            columns: vec!["probe2".into()],
            samples: vec!["sample3".into(), "sampleX".into(), "sample1".into()],
        }])
        .unwrap();
    let probe2 = &results[0].data["probe2"];
    assert_eq!(probe2.len(), 3);
    assert_eq!(probe2[0], 3.2);
    assert!(probe2[1].is_nan());
    assert_eq!(probe2[2], 1.2);
}

/// Back-to-back identical loads are a metadata touch, not a reload.
#[test]
fn reload_is_idempotent() {
    let tmp = temp_testdir::TempDir::default();
    let path = tmp.join("matrix.tsv");
    std::fs::write(&path, "probe\ts1\ts2\np1\t1\t2\n").unwrap();

    let db = Db::open_in_memory().unwrap();
    load_file(&db, &path, false);
    let before = db
        .run_query(
            &Select::default()
                .column("id")
                .from_table("field")
                .order_by(col("id"), Direction::Asc),
        )
        .unwrap();
    load_file(&db, &path, false);
    let after = db
        .run_query(
            &Select::default()
                .column("id")
                .from_table("field")
                .order_by(col("id"), Direction::Asc),
        )
        .unwrap();
    assert_eq!(before, after);
}

/// Deletion cascades and source cleanup through the public API.
#[test]
fn delete_and_clean_sources() {
    let tmp = temp_testdir::TempDir::default();
    let path = tmp.join("matrix.tsv");
    std::fs::write(&path, "probe\ts1\np1\t1\n").unwrap();

    let db = Db::open_in_memory().unwrap();
    load_file(&db, &path, false);
    assert_eq!(count_rows(&db, "source"), 1);

    db.delete_matrix("matrix.tsv").unwrap();
    assert_eq!(count_rows(&db, "dataset"), 0);
    assert_eq!(count_rows(&db, "field"), 0);
    assert_eq!(count_rows(&db, "field_score"), 0);
    assert_eq!(db.clean_sources().unwrap(), 1);
    assert_eq!(count_rows(&db, "source"), 0);

    // Deleting again is fine.
    db.delete_matrix("matrix.tsv").unwrap();
}

/// Row-lookup scalar functions are available to relational queries.
#[test]
fn unpack_functions_project_decoded_values() {
    let tmp = temp_testdir::TempDir::default();
    let path = tmp.join("matrix.tsv");
    std::fs::write(&path, "probe\ts1\ts2\np1\t7.5\t8.5\n").unwrap();

    let db = Db::open_in_memory().unwrap();
    load_file(&db, &path, false);

    use xena_store::query::ast::{lit, CmpOp, Expr};
    // Project the sample name of row 1 through the sampleID field.
    let q = Select::default()
        .item(
            Expr::Call {
                func: "unpack_value".into(),
                args: vec![col("id"), lit(1i64)],
            },
            Some("sample"),
        )
        .from_table("field")
        .filter(Expr::Cmp {
            op: CmpOp::Eq,
            lhs: Box::new(col("name")),
            rhs: Box::new(lit("sampleID")),
        });
    let rows = db.run_query(&q).unwrap();
    assert_eq!(rows[0]["sample"], Value::Text("s2".into()));
}
