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

//! Node layout shared with kazoo-style consumers:
//! `<chroot>/consumers/<group>/ids/<member_id>`.

pub fn group_ids(chroot: &str, group: &str) -> String {
    format!("{}/consumers/{}/ids", chroot.trim_end_matches('/'), group)
}

pub fn member(chroot: &str, group: &str, member_id: &str) -> String {
    format!("{}/{}", group_ids(chroot, group), member_id)
}

/// Splits `path` into its parent and last segment.
pub fn split(path: &str) -> (&str, &str) {
    match path.rsplit_once('/') {
        Some((parent, name)) => (parent, name),
        None => ("", path),
    }
}
