//! Fixed registry of digest algorithms supported by the hash operations.

use std::{
    fmt,
    str::FromStr,
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};
use sha3::{Sha3_256, Sha3_512};

use crate::{HsmError, HsmResult, models::millis};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum HashAlgorithm {
    Md5,
    Sha1,
    Sha256,
    Sha512,
    #[serde(rename = "sha3_256")]
    Sha3_256,
    #[serde(rename = "sha3_512")]
    Sha3_512,
}

impl HashAlgorithm {
    pub const ALL: [HashAlgorithm; 6] = [
        HashAlgorithm::Md5,
        HashAlgorithm::Sha1,
        HashAlgorithm::Sha256,
        HashAlgorithm::Sha512,
        HashAlgorithm::Sha3_256,
        HashAlgorithm::Sha3_512,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            HashAlgorithm::Md5 => "md5",
            HashAlgorithm::Sha1 => "sha1",
            HashAlgorithm::Sha256 => "sha256",
            HashAlgorithm::Sha512 => "sha512",
            HashAlgorithm::Sha3_256 => "sha3_256",
            HashAlgorithm::Sha3_512 => "sha3_512",
        }
    }

    /// Digest length in bytes.
    pub fn output_len(&self) -> usize {
        match self {
            HashAlgorithm::Md5 => 16,
            HashAlgorithm::Sha1 => 20,
            HashAlgorithm::Sha256 | HashAlgorithm::Sha3_256 => 32,
            HashAlgorithm::Sha512 | HashAlgorithm::Sha3_512 => 64,
        }
    }

    pub fn digest(&self, data: &[u8]) -> Vec<u8> {
        match self {
            HashAlgorithm::Md5 => md5::compute(data).0.to_vec(),
            HashAlgorithm::Sha1 => Sha1::digest(data).to_vec(),
            HashAlgorithm::Sha256 => Sha256::digest(data).to_vec(),
            HashAlgorithm::Sha512 => Sha512::digest(data).to_vec(),
            HashAlgorithm::Sha3_256 => Sha3_256::digest(data).to_vec(),
            HashAlgorithm::Sha3_512 => Sha3_512::digest(data).to_vec(),
        }
    }

    pub fn hex_digest(&self, data: &[u8]) -> String {
        hex::encode(self.digest(data))
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HashAlgorithm {
    type Err = HsmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        match normalized.as_str() {
            "md5" => Ok(HashAlgorithm::Md5),
            "sha1" | "sha_1" => Ok(HashAlgorithm::Sha1),
            "sha256" | "sha_256" => Ok(HashAlgorithm::Sha256),
            "sha512" | "sha_512" => Ok(HashAlgorithm::Sha512),
            "sha3_256" => Ok(HashAlgorithm::Sha3_256),
            "sha3_512" => Ok(HashAlgorithm::Sha3_512),
            _ => Err(HsmError::UnsupportedAlgorithm(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HashBenchmark {
    pub algorithm: HashAlgorithm,
    pub rounds: u32,
    #[serde(rename = "time_per_operation_ms", with = "millis")]
    pub per_operation: Duration,
    pub hash_length: usize,
    pub sample: String,
}

/// Times every supported algorithm over `rounds` digests of `data`.
pub fn benchmark(data: &[u8], rounds: u32) -> Vec<HashBenchmark> {
    let rounds = rounds.max(1);
    HashAlgorithm::ALL
        .iter()
        .map(|algorithm| {
            let started = Instant::now();
            let mut last = Vec::new();
            for _ in 0..rounds {
                last = algorithm.digest(data);
            }
            let elapsed = started.elapsed();
            let sample = hex::encode(&last);
            HashBenchmark {
                algorithm: *algorithm,
                rounds,
                per_operation: elapsed / rounds,
                hash_length: sample.len(),
                sample: sample.chars().take(32).collect(),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_vectors() {
        assert_eq!(
            HashAlgorithm::Sha256.hex_digest(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(
            HashAlgorithm::Md5.hex_digest(b"abc"),
            "900150983cd24fb0d6963f7d28e17f72"
        );
        assert_eq!(
            HashAlgorithm::Sha1.hex_digest(b"abc"),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
        assert_eq!(
            HashAlgorithm::Sha3_256.hex_digest(b"abc"),
            "3a985da74fe225b2045c172d6bd390bd855f086e3e9d525b46bfe24511431532"
        );
    }

    #[test]
    fn output_lengths_match_digests() {
        for algorithm in HashAlgorithm::ALL {
            assert_eq!(algorithm.digest(b"payload").len(), algorithm.output_len());
        }
    }

    #[test]
    fn single_byte_change_alters_digest() {
        for algorithm in HashAlgorithm::ALL {
            assert_ne!(algorithm.digest(b"hello"), algorithm.digest(b"hellp"));
        }
    }

    #[test]
    fn parse_accepts_dashes_and_case() {
        assert_eq!(
            "SHA3-256".parse::<HashAlgorithm>().expect("parse"),
            HashAlgorithm::Sha3_256
        );
        assert_eq!(
            "sha-512".parse::<HashAlgorithm>().expect("parse"),
            HashAlgorithm::Sha512
        );
        assert!(matches!(
            "whirlpool".parse::<HashAlgorithm>(),
            Err(HsmError::UnsupportedAlgorithm(name)) if name == "whirlpool"
        ));
    }

    #[test]
    fn benchmark_covers_every_algorithm() {
        let results = benchmark(b"benchmark payload", 4);
        assert_eq!(results.len(), HashAlgorithm::ALL.len());
        let sha512 = results
            .iter()
            .find(|r| r.algorithm == HashAlgorithm::Sha512)
            .expect("sha512 entry");
        assert_eq!(sha512.hash_length, 128);
        assert_eq!(sha512.sample.len(), 32);
    }
}
