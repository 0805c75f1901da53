use proptest::prelude::*;
use smon::parser::{parse_jobs, parse_nodes};
use std::collections::HashSet;

fn job_line() -> impl Strategy<Value = String> {
    (
        1u32..30,
        prop::sample::select(vec!["RUNNING", "PENDING", "COMPLETED", "NODE_FAIL", "bad state!", ""]),
        0u32..6,
        0u32..6,
        prop::sample::select(vec!["00:10:00", "1-00:00:00", "UNLIMITED", "garbage", "5:00", ""]),
        prop::sample::select(vec!["2", "gres/gpu:h100:2", "x", "(null)"]),
    )
        .prop_map(|(id, state, alloc, total, limit, cpus)| {
            format!("{id}|alice|{state}|gpu|node[01-02]|00:01:00|{limit}|{alloc}|{total}|{cpus}")
        })
}

fn noise_line() -> impl Strategy<Value = String> {
    "[a-z0-9| ]{1,40}".prop_filter("blank lines do not count", |s| !s.trim().is_empty())
}

fn node_line() -> impl Strategy<Value = String> {
    (
        1u32..8,
        prop::sample::select(vec!["gpu", "cpu*", "debug"]),
        0u32..9,
        0u32..9,
        0u32..80,
        0u32..80,
    )
        .prop_map(|(n, partition, gpu_alloc, gpu_total, cpu_alloc, cpu_total)| {
            format!(
                "node{n:02}|{partition}|mixed|gpu:{gpu_alloc}|gpu:{gpu_total}|{cpu_alloc}|{cpu_total}|100|1000|"
            )
        })
}

proptest! {
    #[test]
    fn every_job_line_becomes_a_record_or_a_skip(
        lines in prop::collection::vec(prop_oneof![3 => job_line(), 1 => noise_line()], 0..40)
    ) {
        let report = parse_jobs(&lines.join("\n"));

        prop_assert_eq!(report.records.len() + report.skipped(), lines.len());
        let ids = report.records.iter().map(|job| job.job_id.as_str()).collect::<HashSet<_>>();
        prop_assert_eq!(ids.len(), report.records.len());
        for job in &report.records {
            prop_assert!(job.gpu_alloc <= job.gpu_total);
        }
    }

    #[test]
    fn blank_lines_change_nothing_but_line_numbers(
        lines in prop::collection::vec(job_line(), 0..20)
    ) {
        let dense = parse_jobs(&lines.join("\n"));
        let sparse = parse_jobs(&lines.join("\n\n   \n"));

        prop_assert_eq!(dense.records, sparse.records);
        prop_assert_eq!(dense.warnings.len(), sparse.warnings.len());
    }

    #[test]
    fn node_names_are_unique_and_allocations_bounded(
        lines in prop::collection::vec(node_line(), 0..30)
    ) {
        let report = parse_nodes(&lines.join("\n"));

        let names = report.records.iter().map(|node| node.name.as_str()).collect::<HashSet<_>>();
        prop_assert_eq!(names.len(), report.records.len());
        for node in &report.records {
            prop_assert!(node.gpu_alloc <= node.gpu_total);
            prop_assert!(node.cpu_alloc <= node.cpu_total);
            prop_assert!(node.mem_alloc_mb <= node.mem_total_mb);
        }
    }
}

#[test]
fn empty_input_is_an_empty_report() {
    let jobs = parse_jobs("");
    assert!(jobs.records.is_empty());
    assert!(jobs.warnings.is_empty());
    let nodes = parse_nodes("\n\n");
    assert!(nodes.records.is_empty());
    assert!(nodes.warnings.is_empty());
}
