//! # Test Execution Planner Module / 测试执行计划模块
//!
//! Turns the selected files into the ordered list this job will run: sorting,
//! slicing for distributed runs, then moving previously failing files first.
//!
//! 将选中的文件转换为本作业要运行的有序列表：排序、为分布式运行切片，
//! 然后将之前失败的文件移到前面。

use std::path::PathBuf;

use crate::core::config::SortOrder;
use crate::core::models::ParallelRunInfo;
use crate::core::partition::{
    self, FileComparator, ParallelRun, PartitionError, PartitionStrategy,
};
use crate::infra::cache::FailureCache;

/// Represents a complete execution plan for one job.
/// 表示一个作业的完整执行计划。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionPlan {
    /// The files to run, in launch order.
    /// 要运行的文件，按启动顺序排列。
    pub files_to_run: Vec<PathBuf>,
    /// Number of selected files before partitioning.
    /// 分区前选中的文件数量。
    pub total_files: usize,
    /// Present when this job is one of several in a distributed run.
    pub parallel_run: Option<ParallelRunInfo>,
    /// Number of files the failure cache knew as failing.
    pub previous_failures: usize,
}

/// Scheduling inputs that do not come from the file selector.
#[derive(Clone, Default)]
pub struct PlanOptions<'a> {
    pub parallel: Option<ParallelRun>,
    pub strategy: PartitionStrategy,
    pub sort: Option<SortOrder>,
    /// Overrides `sort` when present.
    pub comparator: Option<&'a FileComparator>,
    pub cache: Option<&'a FailureCache>,
    pub cache_enabled: bool,
}

/// Creates an execution plan for the selected files.
///
/// In a distributed run the files are always sorted first (with the custom
/// comparator, or numerically) so every job agrees on the global order.
/// Otherwise they are only sorted when an order was asked for.
///
/// 为选中的文件创建执行计划。在分布式运行中，文件总是先排序，以便每个作业就全局顺序达成一致。
pub fn plan_execution(
    mut files: Vec<PathBuf>,
    options: &PlanOptions<'_>,
) -> Result<ExecutionPlan, PartitionError> {
    let total_files = files.len();

    let (files, parallel_run) = match options.parallel {
        Some(run) => {
            run.validate()?;
            sort(&mut files, options.comparator, options.sort.or(Some(SortOrder::Numeric)));
            let slice = partition::split(&files, run, options.strategy);
            let info = ParallelRunInfo {
                current_index: run.current_index,
                total_runs: run.total_runs,
                current_file_count: slice.len(),
            };
            (slice, Some(info))
        }
        None => {
            sort(&mut files, options.comparator, options.sort);
            (files, None)
        }
    };

    let (files_to_run, previous_failures) = match options.cache {
        Some(cache) if options.cache_enabled => {
            let previous_failures = cache.previous_failures().len();
            (cache.reorder(files, true), previous_failures)
        }
        _ => (files, 0),
    };

    Ok(ExecutionPlan {
        files_to_run,
        total_files,
        parallel_run,
        previous_failures,
    })
}

fn sort(files: &mut [PathBuf], comparator: Option<&FileComparator>, order: Option<SortOrder>) {
    match (comparator, order) {
        (Some(comparator), _) => partition::sort_files(files, Some(comparator)),
        (None, Some(SortOrder::Numeric)) => partition::sort_files(files, None),
        (None, Some(SortOrder::Lexical)) => files.sort(),
        (None, None) => {}
    }
}
