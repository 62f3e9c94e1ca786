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

use dashmap::DashMap;
use murmur2::murmur2;

/// Seed of Kafka's default partitioner.
const KAFKA_SEED: u32 = 0x9747_b28c;

/// Picks the partition of a produced message the way Kafka's default
/// partitioner does for keyed messages: murmur2 of the key, sign bit masked,
/// modulo the partition count. Keyless messages rotate over the partitions.
#[derive(Debug, Default)]
pub struct Partitioner {
    next: DashMap<String, usize>,
}

impl Partitioner {
    /// `partitions` must be sorted and non-empty.
    pub fn partition(&self, topic: &str, key: Option<&[u8]>, partitions: &[i32]) -> i32 {
        let index = match key {
            Some(key) => hash_index(key, partitions.len()),
            None => {
                let mut next = self.next.entry(topic.to_string()).or_insert(0);
                let index = *next % partitions.len();
                *next = next.wrapping_add(1);
                index
            }
        };
        partitions[index]
    }
}

fn hash_index(key: &[u8], count: usize) -> usize {
    (murmur2(key, KAFKA_SEED) & 0x7fff_ffff) as usize % count
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keyed_messages_stick_to_a_partition() {
        let partitioner = Partitioner::default();
        let partitions = [0, 1, 2, 3, 4, 5];
        let first = partitioner.partition("t", Some(b"user-42"), &partitions);
        for _ in 0..10 {
            assert_eq!(partitioner.partition("t", Some(b"user-42"), &partitions), first);
        }
        assert_eq!(
            first as usize,
            hash_index(b"user-42", partitions.len())
        );
    }

    #[test]
    fn test_keyless_messages_rotate() {
        let partitioner = Partitioner::default();
        let partitions = [0, 1, 2];
        let picked: Vec<i32> = (0..6)
            .map(|_| partitioner.partition("t", None, &partitions))
            .collect();
        assert_eq!(picked, vec![0, 1, 2, 0, 1, 2]);
        // every topic rotates on its own
        assert_eq!(partitioner.partition("other", None, &partitions), 0);
    }

    #[test]
    fn test_keys_spread_over_partitions() {
        let partitioner = Partitioner::default();
        let partitions = [0, 1, 2, 3];
        let mut used = std::collections::BTreeSet::new();
        for i in 0..100 {
            let key = format!("key-{}", i);
            used.insert(partitioner.partition("t", Some(key.as_bytes()), &partitions));
        }
        assert_eq!(used.len(), partitions.len());
    }
}
