use std::collections::BTreeMap;
use std::fmt;

use itertools::Itertools;
use serde_json::json;

use crate::{
    constants::{SORT_AND_EXTREMA_CALLS, SORT_CALLS},
    core::{
        domain::{ExecutionLimits, RunRequest, TestCase, is_identifier},
        value::Value,
    },
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Category {
    MergeSort,
    QuickSort,
    BinarySearch,
    SortingFundamentals,
    LegacyBubbleSort,
    LegacyMergeSort,
    LegacySelectionSort,
}

impl Category {
    /// Built-in calls a candidate may not use for problems of this category.
    pub fn forbidden_calls(&self) -> &'static [&'static str] {
        match self {
            Category::SortingFundamentals => SORT_CALLS,
            Category::LegacyBubbleSort
            | Category::LegacyMergeSort
            | Category::LegacySelectionSort => SORT_AND_EXTREMA_CALLS,
            Category::MergeSort | Category::QuickSort | Category::BinarySearch => &[],
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Category::MergeSort => "Merge Sort",
            Category::QuickSort => "Quick Sort",
            Category::BinarySearch => "Binary Search",
            Category::SortingFundamentals => "Sorting Fundamentals",
            Category::LegacyBubbleSort => "Bubble Sort (classic)",
            Category::LegacyMergeSort => "Merge Sort (classic)",
            Category::LegacySelectionSort => "Selection Sort (classic)",
        };
        f.write_str(label)
    }
}

#[derive(Clone, Debug)]
pub struct ProblemSpec {
    pub id: String,
    pub title: String,
    pub category: Category,
    pub entry_point: String,
    pub params: Vec<String>,
    pub cases: Vec<TestCase>,
}

impl ProblemSpec {
    /// Starter code a learner fills in.
    pub fn template(&self) -> String {
        format!(
            "function {}({}) {{\n  // Write your solution here\n}}\n",
            self.entry_point,
            self.params.join(", ")
        )
    }

    pub fn request(&self, source_text: String, limits: ExecutionLimits) -> RunRequest {
        RunRequest {
            source_text,
            entry_point: self.entry_point.clone(),
            cases: self.cases.clone(),
            limits,
            forbidden_calls: self
                .category
                .forbidden_calls()
                .iter()
                .map(|c| c.to_string())
                .collect(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("No tests available for problem '{problem_id}'")]
    NoTestsRegistered { problem_id: String },
    #[error("Problem '{problem_id}' has no test cases")]
    EmptyCases { problem_id: String },
    #[error("Problem '{problem_id}': '{entry_point}' is not a valid identifier")]
    InvalidEntryPoint {
        problem_id: String,
        entry_point: String,
    },
    #[error("Problem '{problem_id}': case {index} passes {actual} arguments, expected {expected}")]
    ArityMismatch {
        problem_id: String,
        index: usize,
        expected: usize,
        actual: usize,
    },
    #[error("Problem '{problem_id}' is registered twice")]
    Duplicate { problem_id: String },
}

/// Read-only lookup table from problem id to its tests.
#[derive(Clone, Debug)]
pub struct TestRegistry {
    problems: BTreeMap<String, ProblemSpec>,
}

impl TestRegistry {
    pub fn new<I>(problems: I) -> Result<Self, RegistryError>
    where
        I: IntoIterator<Item = ProblemSpec>,
    {
        let mut by_id = BTreeMap::new();
        for problem in problems {
            validate(&problem)?;
            if by_id.contains_key(&problem.id) {
                return Err(RegistryError::Duplicate {
                    problem_id: problem.id,
                });
            }
            by_id.insert(problem.id.clone(), problem);
        }
        Ok(Self { problems: by_id })
    }

    /// The catalog shipped with the practice pages.
    pub fn builtin() -> Result<Self, RegistryError> {
        Self::new(catalog())
    }

    pub fn lookup(&self, problem_id: &str) -> Option<&ProblemSpec> {
        self.problems.get(problem_id)
    }

    pub fn require(&self, problem_id: &str) -> Result<&ProblemSpec, RegistryError> {
        self.lookup(problem_id)
            .ok_or_else(|| RegistryError::NoTestsRegistered {
                problem_id: problem_id.to_string(),
            })
    }

    pub fn problems(&self) -> impl Iterator<Item = &ProblemSpec> {
        self.problems.values()
    }

    pub fn len(&self) -> usize {
        self.problems.len()
    }
}

fn validate(problem: &ProblemSpec) -> Result<(), RegistryError> {
    if !is_identifier(&problem.entry_point) {
        return Err(RegistryError::InvalidEntryPoint {
            problem_id: problem.id.clone(),
            entry_point: problem.entry_point.clone(),
        });
    }
    if problem.cases.is_empty() {
        return Err(RegistryError::EmptyCases {
            problem_id: problem.id.clone(),
        });
    }
    if let Some((index, case)) = problem
        .cases
        .iter()
        .find_position(|case| case.input.len() != problem.params.len())
    {
        return Err(RegistryError::ArityMismatch {
            problem_id: problem.id.clone(),
            index,
            expected: problem.params.len(),
            actual: case.input.len(),
        });
    }
    Ok(())
}

fn problem(
    id: &str,
    title: &str,
    category: Category,
    entry_point: &str,
    params: &[&str],
    cases: Vec<TestCase>,
) -> ProblemSpec {
    ProblemSpec {
        id: id.to_string(),
        title: title.to_string(),
        category,
        entry_point: entry_point.to_string(),
        params: params.iter().map(|p| p.to_string()).collect(),
        cases,
    }
}

/// `input` is the positional argument list.
fn case(input: serde_json::Value, expected: serde_json::Value) -> TestCase {
    let input = match input {
        serde_json::Value::Array(args) => args.into_iter().map(Value::from).collect(),
        single => vec![Value::from(single)],
    };
    TestCase {
        input,
        expected: expected.into(),
    }
}

fn catalog() -> Vec<ProblemSpec> {
    use Category::*;

    vec![
        problem(
            "merge-intervals",
            "Merge Intervals",
            MergeSort,
            "merge",
            &["intervals"],
            vec![
                case(
                    json!([[[1, 3], [2, 6], [8, 10], [15, 18]]]),
                    json!([[1, 6], [8, 10], [15, 18]]),
                ),
                case(json!([[[1, 4], [4, 5]]]), json!([[1, 5]])),
            ],
        ),
        problem(
            "sort-list",
            "Sort List",
            MergeSort,
            "sortList",
            &["head"],
            vec![
                case(json!([[4, 2, 1, 3]]), json!([1, 2, 3, 4])),
                case(json!([[-1, 5, 3, 4, 0]]), json!([-1, 0, 3, 4, 5])),
            ],
        ),
        problem(
            "count-inversions",
            "Count Inversions",
            MergeSort,
            "countInversions",
            &["arr"],
            vec![
                case(json!([[2, 3, 8, 6, 1]]), json!(5)),
                case(json!([[1, 20, 6, 4, 5]]), json!(5)),
            ],
        ),
        problem(
            "kth-largest",
            "Kth Largest Element in an Array",
            QuickSort,
            "findKthLargest",
            &["nums", "k"],
            vec![
                case(json!([[3, 2, 1, 5, 6, 4], 2]), json!(5)),
                case(json!([[3, 2, 3, 1, 2, 4, 5, 5, 6], 4]), json!(4)),
            ],
        ),
        problem(
            "sort-colors",
            "Sort Colors",
            QuickSort,
            "sortColors",
            &["nums"],
            vec![
                case(json!([[2, 0, 2, 1, 1, 0]]), json!([0, 0, 1, 1, 2, 2])),
                case(json!([[0, 1, 2, 2, 1, 0]]), json!([0, 0, 1, 1, 2, 2])),
            ],
        ),
        problem(
            "partition-labels",
            "Partition Labels",
            QuickSort,
            "partitionLabels",
            &["s"],
            vec![
                case(json!(["ababcbacadefegdehijhklij"]), json!([9, 7, 8])),
                case(json!(["eccbbbbdec"]), json!([10])),
            ],
        ),
        problem(
            "search-insert",
            "Search Insert Position",
            BinarySearch,
            "searchInsert",
            &["nums", "target"],
            vec![
                case(json!([[1, 3, 5, 6], 5]), json!(2)),
                case(json!([[1, 3, 5, 6], 2]), json!(1)),
                case(json!([[1, 3, 5, 6], 7]), json!(4)),
            ],
        ),
        problem(
            "find-peak",
            "Find Peak Element",
            BinarySearch,
            "findPeakElement",
            &["nums"],
            vec![
                case(json!([[1, 2, 3, 1]]), json!(2)),
                case(json!([[1, 2, 1, 3, 5, 6, 4]]), json!(5)),
            ],
        ),
        problem(
            "search-rotated",
            "Search in Rotated Sorted Array",
            BinarySearch,
            "search",
            &["nums", "target"],
            vec![
                case(json!([[4, 5, 6, 7, 0, 1, 2], 0]), json!(4)),
                case(json!([[6, 7, 0, 1, 2, 4, 5], 3]), json!(-1)),
            ],
        ),
        problem(
            "bubble-sort-implementation",
            "Bubble Sort Implementation",
            SortingFundamentals,
            "bubbleSort",
            &["arr"],
            vec![
                case(
                    json!([[64, 34, 25, 12, 22, 11, 90]]),
                    json!([11, 12, 22, 25, 34, 64, 90]),
                ),
                case(json!([[3, 2, 1]]), json!([1, 2, 3])),
            ],
        ),
        problem(
            "insertion-sort-implementation",
            "Insertion Sort Implementation",
            SortingFundamentals,
            "insertionSort",
            &["arr"],
            vec![
                case(json!([[5, 2, 4, 6, 1, 3]]), json!([1, 2, 3, 4, 5, 6])),
                case(json!([[1, 2, 3]]), json!([1, 2, 3])),
            ],
        ),
        problem(
            "selection-sort-implementation",
            "Selection Sort Implementation",
            SortingFundamentals,
            "selectionSort",
            &["arr"],
            vec![
                case(json!([[29, 10, 14, 37, 13]]), json!([10, 13, 14, 29, 37])),
                case(json!([[3, 1, 2]]), json!([1, 2, 3])),
            ],
        ),
        problem(
            "sort-comparison",
            "Compare Sorting Algorithms",
            SortingFundamentals,
            "compareSortingAlgorithms",
            &["arr", "algorithms"],
            vec![case(
                json!([[3, 1, 4, 1, 5], ["bubble", "insertion", "selection"]]),
                json!({ "bubble": {}, "insertion": {}, "selection": {} }),
            )],
        ),
        problem(
            "bubble_sort/1",
            "Bubble Sort Basic Algorithm",
            LegacyBubbleSort,
            "bubbleSort",
            &["arr"],
            vec![
                case(json!([[6, 3, 2, 5, 9]]), json!([2, 3, 5, 6, 9])),
                case(json!([[75, 89, 35, 12, 9, 100]]), json!([9, 12, 35, 75, 89, 100])),
            ],
        ),
        problem(
            "bubble_sort/2",
            "Count Swaps in Bubble Sort",
            LegacyBubbleSort,
            "bubbleSort",
            &["arr"],
            vec![
                case(json!([[6, 3, 2, 5, 9]]), json!(4)),
                case(json!([[75, 89, 35, 12, 9, 100]]), json!(9)),
            ],
        ),
        problem(
            "bubble_sort/3",
            "Bubble Sort Strings",
            LegacyBubbleSort,
            "bubbleSort",
            &["arr"],
            vec![
                case(
                    json!([["banana", "apple", "cherry"]]),
                    json!(["apple", "banana", "cherry"]),
                ),
                case(
                    json!([["dog", "zebra", "cat", "ant", "hippo"]]),
                    json!(["ant", "cat", "dog", "hippo", "zebra"]),
                ),
            ],
        ),
        problem(
            "bubble_sort/4",
            "Bubble Sort Iteration Counter",
            LegacyBubbleSort,
            "bubbleSort",
            &["arr"],
            vec![
                case(json!([[6, 3, 2, 5, 9]]), json!(3)),
                case(json!([[75, 89, 35, 12, 9, 100]]), json!(5)),
            ],
        ),
        problem(
            "bubble_sort/5",
            "Custom Bubble Sort",
            LegacyBubbleSort,
            "bubbleSort",
            &["arr"],
            vec![
                case(json!([[4, 3, 2, 1, 9]]), json!([3, 1, 4, 2, 9])),
                case(json!([[68, 11, 46, 35, 28, 51]]), json!([11, 35, 28, 46, 51, 68])),
            ],
        ),
        problem(
            "merge_sort/1",
            "Merge Two Sorted Arrays",
            LegacyMergeSort,
            "mergeSort",
            &["arr1", "arr2"],
            vec![
                case(json!([[1, 3, 5], [2, 4, 6]]), json!([1, 2, 3, 4, 5, 6])),
                case(json!([[10, 20], [5, 15, 25]]), json!([5, 10, 15, 20, 25])),
            ],
        ),
        problem(
            "merge_sort/2",
            "Recursive Maximum of an Array",
            LegacyMergeSort,
            "findMax",
            &["arr"],
            vec![
                case(json!([[3, 1, 7, 4]]), json!(7)),
                case(json!([[10, 2, 5, 8, 6]]), json!(10)),
            ],
        ),
        problem(
            "merge_sort/3",
            "Merge Sort Basic Algorithm",
            LegacyMergeSort,
            "mergeSort",
            &["arr"],
            vec![
                case(json!([[8, 3, 1, 7, 0, 10, 2]]), json!([0, 1, 2, 3, 7, 8, 10])),
                case(json!([[15, 9, 27, 6, 12]]), json!([6, 9, 12, 15, 27])),
            ],
        ),
        problem(
            "merge_sort/4",
            "Count Inversions using Merge Sort",
            LegacyMergeSort,
            "countInversions",
            &["arr"],
            vec![
                case(json!([[2, 4, 1, 3, 5]]), json!(3)),
                case(json!([[5, 4, 3, 2, 1]]), json!(10)),
            ],
        ),
        problem(
            "merge_sort/5",
            "Counting Reverse Pairs",
            LegacyMergeSort,
            "countReversePairs",
            &["arr"],
            vec![
                case(json!([[1, 3, 2, 3, 1]]), json!(2)),
                case(json!([[2, 4, 3, 5, 1]]), json!(3)),
            ],
        ),
        problem(
            "selection_sort/1",
            "Find the Minimum Index",
            LegacySelectionSort,
            "findMinIndex",
            &["arr"],
            vec![
                case(json!([[5, 2, 9, 1, 5, 6]]), json!(3)),
                case(json!([[10, 7, 8, 3, 2, 1]]), json!(5)),
            ],
        ),
        problem(
            "selection_sort/2",
            "Selection Sort Basic Algorithm",
            LegacySelectionSort,
            "selectionSort",
            &["arr"],
            vec![
                case(json!([[5, 2, 9, 1, 5, 6]]), json!([1, 2, 5, 5, 6, 9])),
                case(json!([[10, 7, 8, 3, 2, 1]]), json!([1, 2, 3, 7, 8, 10])),
            ],
        ),
        problem(
            "selection_sort/3",
            "Custom Selection Sort Comparison",
            LegacySelectionSort,
            "selectionSort",
            &["arr"],
            vec![
                case(json!([[5, 2, 9, 1, 4, 6]]), json!([2, 4, 6, 1, 5, 9])),
                case(json!([[10, 7, 8, 3, 2, 1]]), json!([2, 8, 10, 1, 3, 7])),
            ],
        ),
        problem(
            "selection_sort/4",
            "Selection Sort Students by Score",
            LegacySelectionSort,
            "selectionSort",
            &["students"],
            vec![case(
                json!([[
                    { "name": "Alice", "score": 85 },
                    { "name": "Bob", "score": 92 },
                    { "name": "Charlie", "score": 85 }
                ]]),
                json!([
                    { "name": "Bob", "score": 92 },
                    { "name": "Alice", "score": 85 },
                    { "name": "Charlie", "score": 85 }
                ]),
            )],
        ),
    ]
}
