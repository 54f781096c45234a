pub mod colors;
pub mod shutdown;

use serde::Serialize;
use sha2::{Digest, Sha256};

pub(crate) const MANAGER_NAME: &str = "cluster-operator";

/// Content hash of a serializable value, used to detect drift between a
/// rendered child resource and the one last observed in C1.
pub fn hash_spec<T: Serialize>(spec: &T) -> String {
    let bytes = serde_json::to_vec(spec).expect("spec serializes");
    let digest = Sha256::digest(&bytes);
    hex::encode(digest)
}
