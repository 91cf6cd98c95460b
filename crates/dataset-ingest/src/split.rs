// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 Au-Zone Technologies. All Rights Reserved.

//! Randomized train/validation/holdout split planning.
//!
//! Files are shuffled with a uniform random permutation so group membership
//! does not follow selection order, then consecutive runs of the shuffled
//! list are assigned to each group according to its ratio. Rounding leaves a
//! remainder which goes to the largest group.
//!
//! Every plan contains `Training` and `Validation` groups, possibly empty.

use crate::FileEntry;
use log::debug;
use rand::{Rng, seq::SliceRandom as _};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const TRAINING: &str = "Training";
pub const VALIDATION: &str = "Validation";
/// Name given to a third group when the caller does not provide one.
pub const DEFAULT_OTHER_GROUP: &str = "Test";
/// Catch-all group used only when no group received a positive ratio.
pub const UNTAGGED: &str = "Untagged";

/// How files are distributed across groups.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "kebab-case")]
pub enum SplitMode {
    /// Every file goes to `Training`.
    TrainingOnly,
    /// 80% `Training`, 20% `Validation`.
    Auto,
    /// Caller-supplied percentages. Whatever is left of 100% forms a third
    /// group named `other_name` (default `Test`).
    Manual {
        training: u32,
        validation: u32,
        other_name: Option<String>,
    },
}

impl SplitMode {
    /// Group names and percentages, in assignment order.
    fn ratios(&self) -> Vec<(String, u32)> {
        match self {
            SplitMode::TrainingOnly => vec![(TRAINING.to_string(), 100)],
            SplitMode::Auto => vec![(TRAINING.to_string(), 80), (VALIDATION.to_string(), 20)],
            SplitMode::Manual {
                training,
                validation,
                other_name,
            } => {
                let training = (*training).min(100);
                let validation = (*validation).min(100);
                let other = 100u32.saturating_sub(training + validation);
                let other_name = other_name
                    .as_deref()
                    .map(str::trim)
                    .filter(|n| !n.is_empty())
                    .unwrap_or(DEFAULT_OTHER_GROUP);

                let mut ratios = vec![
                    (TRAINING.to_string(), training),
                    (VALIDATION.to_string(), validation),
                ];
                if other > 0 {
                    ratios.push((other_name.to_string(), other));
                }
                ratios
            }
        }
    }
}

/// One named group of file ids.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitGroup {
    pub name: String,
    pub ids: Vec<String>,
}

/// Disjoint, exhaustive assignment of file ids to named groups.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitPlan {
    groups: Vec<SplitGroup>,
}

impl SplitPlan {
    pub fn groups(&self) -> &[SplitGroup] {
        &self.groups
    }

    pub fn group_names(&self) -> Vec<String> {
        self.groups.iter().map(|g| g.name.clone()).collect()
    }

    /// Ids assigned to `name`, if the group exists.
    pub fn group(&self, name: &str) -> Option<&[String]> {
        self.groups
            .iter()
            .find(|g| g.name == name)
            .map(|g| g.ids.as_slice())
    }

    /// Map from file id to group name.
    pub fn assignments(&self) -> HashMap<&str, &str> {
        self.groups
            .iter()
            .flat_map(|g| g.ids.iter().map(move |id| (id.as_str(), g.name.as_str())))
            .collect()
    }

    /// Total number of assigned ids.
    pub fn len(&self) -> usize {
        self.groups.iter().map(|g| g.ids.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn group_mut(&mut self, name: &str) -> &mut SplitGroup {
        let index = match self.groups.iter().position(|g| g.name == name) {
            Some(index) => index,
            None => {
                self.groups.push(SplitGroup {
                    name: name.to_string(),
                    ids: Vec::new(),
                });
                self.groups.len() - 1
            }
        };
        &mut self.groups[index]
    }
}

/// Plan a split using the thread-local random generator.
pub fn plan(files: &[FileEntry], mode: &SplitMode) -> SplitPlan {
    plan_with_rng(files, mode, &mut rand::thread_rng())
}

/// Plan a split with a caller-supplied random generator.
pub fn plan_with_rng<R: Rng + ?Sized>(
    files: &[FileEntry],
    mode: &SplitMode,
    rng: &mut R,
) -> SplitPlan {
    let mut ids: Vec<String> = files.iter().map(|f| f.id.clone()).collect();
    ids.shuffle(rng);

    let total = ids.len();
    let mut remaining = ids.into_iter();
    let mut plan = SplitPlan::default();

    for (name, percent) in mode.ratios() {
        if percent == 0 {
            continue;
        }
        let take = total * percent as usize / 100;
        let group = plan.group_mut(&name);
        group.ids.extend(remaining.by_ref().take(take));
    }

    let leftover: Vec<String> = remaining.collect();
    if !leftover.is_empty() {
        let mut target = None;
        for (index, group) in plan.groups.iter().enumerate() {
            match target {
                Some((_, len)) if group.ids.len() <= len => {}
                _ => target = Some((index, group.ids.len())),
            }
        }
        match target {
            Some((index, _)) => plan.groups[index].ids.extend(leftover),
            None => plan.group_mut(UNTAGGED).ids.extend(leftover),
        }
    }

    plan.group_mut(TRAINING);
    plan.group_mut(VALIDATION);

    debug!(
        "Split plan: {}",
        plan.groups
            .iter()
            .map(|g| format!("{}={}", g.name, g.ids.len()))
            .collect::<Vec<_>>()
            .join(", ")
    );
    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{SeedableRng as _, rngs::StdRng};
    use std::collections::HashSet;

    fn files(n: usize) -> Vec<FileEntry> {
        (0..n)
            .map(|i| FileEntry::from_direct(&format!("img_{:04}.png", i), vec![0; i % 7], None))
            .collect()
    }

    fn sizes(plan: &SplitPlan) -> Vec<(String, usize)> {
        plan.groups()
            .iter()
            .map(|g| (g.name.clone(), g.ids.len()))
            .collect()
    }

    fn assert_partition(files: &[FileEntry], plan: &SplitPlan) {
        let mut seen = HashSet::new();
        for group in plan.groups() {
            for id in &group.ids {
                assert!(seen.insert(id.clone()), "duplicate id {}", id);
            }
        }
        let expected: HashSet<String> = files.iter().map(|f| f.id.clone()).collect();
        assert_eq!(seen, expected);
        assert!(plan.group(TRAINING).is_some());
        assert!(plan.group(VALIDATION).is_some());
    }

    #[test]
    fn test_partition_property_across_modes() {
        let mut rng = StdRng::seed_from_u64(7);
        let modes = [
            SplitMode::TrainingOnly,
            SplitMode::Auto,
            SplitMode::Manual {
                training: 70,
                validation: 20,
                other_name: Some("Holdout".into()),
            },
            SplitMode::Manual {
                training: 0,
                validation: 0,
                other_name: None,
            },
            SplitMode::Manual {
                training: 90,
                validation: 90,
                other_name: None,
            },
        ];
        for n in [0, 1, 2, 3, 7, 10, 33, 101] {
            let files = files(n);
            for mode in &modes {
                let plan = plan_with_rng(&files, mode, &mut rng);
                assert_partition(&files, &plan);
                assert_eq!(plan.len(), n);
            }
        }
    }

    #[test]
    fn test_auto_split_ten_files() {
        let split = plan(&files(10), &SplitMode::Auto);
        assert_eq!(
            sizes(&split),
            [("Training".to_string(), 8), ("Validation".to_string(), 2)]
        );
    }

    #[test]
    fn test_training_only() {
        let split = plan(&files(5), &SplitMode::TrainingOnly);
        assert_eq!(split.group(TRAINING).map(|g| g.len()), Some(5));
        assert_eq!(split.group(VALIDATION).map(|g| g.len()), Some(0));
    }

    #[test]
    fn test_manual_third_group() {
        let mode = SplitMode::Manual {
            training: 70,
            validation: 20,
            other_name: None,
        };
        let split = plan(&files(20), &mode);
        assert_eq!(
            sizes(&split),
            [
                ("Training".to_string(), 14),
                ("Validation".to_string(), 4),
                ("Test".to_string(), 2)
            ]
        );

        let no_third = SplitMode::Manual {
            training: 50,
            validation: 50,
            other_name: Some("Holdout".into()),
        };
        let split = plan(&files(4), &no_third);
        assert_eq!(split.group_names(), ["Training", "Validation"]);
    }

    #[test]
    fn test_remainder_goes_to_largest_group() {
        // 7 * 0.8 = 5.6 and 7 * 0.2 = 1.4 leave one file over.
        let split = plan(&files(7), &SplitMode::Auto);
        assert_eq!(split.group(TRAINING).map(|g| g.len()), Some(6));
        assert_eq!(split.group(VALIDATION).map(|g| g.len()), Some(1));

        // Ties resolve to the first group in iteration order.
        let split = plan(&files(1), &SplitMode::Auto);
        assert_eq!(split.group(TRAINING).map(|g| g.len()), Some(1));
    }

    #[test]
    fn test_zero_ratios_keep_required_groups() {
        let mode = SplitMode::Manual {
            training: 0,
            validation: 0,
            other_name: Some("Everything".into()),
        };
        let split = plan(&files(3), &mode);
        assert_eq!(split.group("Everything").map(|g| g.len()), Some(3));
        assert_eq!(split.group(TRAINING).map(|g| g.len()), Some(0));
        assert_eq!(split.group(VALIDATION).map(|g| g.len()), Some(0));
    }

    #[test]
    fn test_seeded_plans_are_reproducible() {
        let files = files(25);
        let a = plan_with_rng(&files, &SplitMode::Auto, &mut StdRng::seed_from_u64(1));
        let b = plan_with_rng(&files, &SplitMode::Auto, &mut StdRng::seed_from_u64(1));
        assert_eq!(a, b);
        assert_eq!(a.assignments().len(), 25);
    }

    #[test]
    fn test_split_mode_serde() {
        let mode: SplitMode = serde_json::from_str(
            r#"{"mode": "manual", "training": 60, "validation": 30, "other_name": "Holdout"}"#,
        )
        .unwrap();
        assert_eq!(
            mode,
            SplitMode::Manual {
                training: 60,
                validation: 30,
                other_name: Some("Holdout".into())
            }
        );
        let mode: SplitMode = serde_json::from_str(r#"{"mode": "training-only"}"#).unwrap();
        assert_eq!(mode, SplitMode::TrainingOnly);
    }
}
