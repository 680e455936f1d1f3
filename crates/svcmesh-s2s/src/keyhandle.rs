use std::fmt;

/// Points to a single asymmetric signing key version in KMS. Immutable once resolved at boot.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct KeyHandle {
    pub project: String,
    pub location: String,
    pub ring: String,
    pub key: String,
    pub version: String,
}

impl KeyHandle {
    pub fn new(
        project: impl Into<String>,
        location: impl Into<String>,
        ring: impl Into<String>,
        key: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            project: project.into(),
            location: location.into(),
            ring: ring.into(),
            key: key.into(),
            version: version.into(),
        }
    }

    /// Deterministic `kid`: `project:location:ring:key:version`.
    pub fn kid(&self) -> String {
        format!("{}:{}:{}:{}:{}", self.project, self.location, self.ring, self.key, self.version)
    }

    /// Path of the key version on the KMS REST surface, e.g.
    /// `projects/p/locations/l/keyRings/r/cryptoKeys/k/cryptoKeyVersions/v`.
    pub fn resource_name(&self) -> String {
        format!(
            "projects/{}/locations/{}/keyRings/{}/cryptoKeys/{}/cryptoKeyVersions/{}",
            self.project, self.location, self.ring, self.key, self.version
        )
    }
}

impl fmt::Display for KeyHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.kid())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kid_is_deterministic() {
        let handle = KeyHandle::new("proj", "us", "ring", "key", "3");
        assert_eq!(handle.kid(), "proj:us:ring:key:3");
        assert_eq!(handle.kid(), handle.kid());
    }
}
