// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::collections::{BTreeMap, BTreeSet};

/// Partitions of one topic owned by one member.
pub type PartitionSet = BTreeSet<i32>;

/// Range assignment of a topic's partitions across a group's members.
///
/// Every member runs the same computation over the same inputs, so no leader
/// is needed. Members are ordered lexicographically and partitions
/// numerically; each member receives one contiguous range, and the first
/// `partitions % members` members receive one extra partition. Adding or
/// removing a member shifts range boundaries, so a rebalance can move
/// partitions between members that stayed in the group.
pub struct PartitionAssigner;

impl PartitionAssigner {
    pub fn assign_all<S: AsRef<str>>(
        members: &[S],
        partitions: &[i32],
    ) -> BTreeMap<String, PartitionSet> {
        let members: BTreeSet<&str> = members.iter().map(|member| member.as_ref()).collect();
        let partitions: Vec<i32> = partitions
            .iter()
            .copied()
            .collect::<BTreeSet<i32>>()
            .into_iter()
            .collect();

        let mut assignment = BTreeMap::new();
        if members.is_empty() {
            return assignment;
        }
        let per_member = partitions.len() / members.len();
        let extra = partitions.len() % members.len();

        let mut start = 0;
        for (position, member) in members.into_iter().enumerate() {
            let count = per_member + usize::from(position < extra);
            let owned = partitions[start..start + count].iter().copied().collect();
            start += count;
            assignment.insert(member.to_string(), owned);
        }
        assignment
    }

    /// The share of `me`. A member missing from `members` owns nothing.
    pub fn assign<S: AsRef<str>>(me: &str, members: &[S], partitions: &[i32]) -> PartitionSet {
        Self::assign_all(members, partitions)
            .remove(me)
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(&["a"], 4)]
    #[case(&["a", "b"], 4)]
    #[case(&["a", "b", "c"], 4)]
    #[case(&["a", "b", "c"], 10)]
    #[case(&["a", "b", "c", "d", "e"], 3)]
    fn test_covers_every_partition_once(#[case] members: &[&str], #[case] partitions: i32) {
        let partitions: Vec<i32> = (0..partitions).collect();
        let assignment = PartitionAssigner::assign_all(members, &partitions);

        let mut seen = Vec::new();
        for owned in assignment.values() {
            seen.extend(owned.iter().copied());
        }
        seen.sort();
        assert_eq!(seen, partitions);

        let counts: Vec<usize> = assignment.values().map(BTreeSet::len).collect();
        let max = counts.iter().max().copied().unwrap_or_default();
        let min = counts.iter().min().copied().unwrap_or_default();
        assert!(max - min <= 1, "unbalanced: {:?}", assignment);
    }

    #[test]
    fn test_independent_of_input_order() {
        let a = PartitionAssigner::assign_all(&["m2", "m1", "m3", "m1"], &[3, 1, 0, 2, 4]);
        let b = PartitionAssigner::assign_all(&["m1", "m3", "m2"], &[0, 1, 2, 3, 4]);
        assert_eq!(a, b);
        assert_eq!(a["m1"], PartitionSet::from([0, 1]));
        assert_eq!(a["m2"], PartitionSet::from([2, 3]));
        assert_eq!(a["m3"], PartitionSet::from([4]));
    }

    #[test]
    fn test_single_member_then_second_joins() {
        let partitions = [0, 1, 2, 3];
        assert_eq!(
            PartitionAssigner::assign("a", &["a"], &partitions),
            PartitionSet::from([0, 1, 2, 3])
        );
        assert_eq!(
            PartitionAssigner::assign("a", &["a", "b"], &partitions),
            PartitionSet::from([0, 1])
        );
        assert_eq!(
            PartitionAssigner::assign("b", &["a", "b"], &partitions),
            PartitionSet::from([2, 3])
        );
    }

    #[test]
    fn test_absent_member_and_empty_inputs() {
        assert!(PartitionAssigner::assign("z", &["a", "b"], &[0, 1]).is_empty());
        assert!(PartitionAssigner::assign::<&str>("a", &[], &[0, 1]).is_empty());
        assert!(PartitionAssigner::assign("a", &["a"], &[]).is_empty());
    }
}
