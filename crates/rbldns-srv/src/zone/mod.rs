//! Zones and the immutable snapshots built from them.
//!
//! A zone is declared as `name:type:file,file...`; repeating a name adds more
//! files to the same zone. [`ZoneSet`] knows the declared zones and turns
//! them into a [`ZoneSnapshot`], the unit the request loop answers from.
//! Snapshots are never modified after they are built: a reload either
//! produces a whole new snapshot or leaves the current one in place.

pub mod ip4set;

use chrono::{DateTime, Utc};
use hickory_proto::rr::Name;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, warn};

use crate::netlist::CidrPolicy;
use crate::SrvError;
use ip4set::Ip4Set;

/// Dataset types this server can load.
pub const DATASET_TYPES: &[(&str, &str)] =
    &[("ip4set", "set of IP addresses and CIDR ranges")];

/// One `name:type:file,...` declaration, after merging repeated names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZoneSpec {
    pub origin: Name,
    pub files: Vec<PathBuf>,
}

/// Parse zone declarations, merging repeated zone names.
pub fn parse_zone_specs<S: AsRef<str>>(specs: &[S]) -> crate::Result<Vec<ZoneSpec>> {
    let mut zones: Vec<ZoneSpec> = Vec::new();

    for raw in specs {
        let raw = raw.as_ref();
        let mut parts = raw.splitn(3, ':');
        let (Some(name), Some(kind), Some(files)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(SrvError::Config(format!(
                "invalid zone spec `{raw}' (expected name:type:file,...)"
            )));
        };
        if !DATASET_TYPES.iter().any(|(t, _)| *t == kind) {
            return Err(SrvError::Config(format!("unknown dataset type `{kind}'")));
        }
        if name.is_empty() {
            return Err(SrvError::Config(format!("missing zone name in `{raw}'")));
        }
        let mut origin = Name::from_ascii(name)
            .map_err(|e| SrvError::Config(format!("invalid zone name `{name}': {e}")))?
            .to_lowercase();
        origin.set_fqdn(true);

        let files: Vec<PathBuf> = files
            .split(',')
            .filter(|f| !f.is_empty())
            .map(PathBuf::from)
            .collect();
        if files.is_empty() {
            return Err(SrvError::Config(format!("no files for zone `{name}'")));
        }

        match zones.iter_mut().find(|z| z.origin == origin) {
            Some(zone) => zone.files.extend(files),
            None => zones.push(ZoneSpec { origin, files }),
        }
    }

    Ok(zones)
}

/// Modification time and size of a source file when it was loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStamp {
    pub path: PathBuf,
    pub modified: Option<SystemTime>,
    pub len: u64,
}

impl FileStamp {
    fn read(path: &Path) -> crate::Result<Self> {
        let meta = std::fs::metadata(path)
            .map_err(|e| SrvError::Reload(format!("{}: {e}", path.display())))?;
        Ok(Self {
            path: path.to_path_buf(),
            modified: meta.modified().ok(),
            len: meta.len(),
        })
    }
}

/// A zone's loaded data.
#[derive(Debug, Clone)]
pub struct LoadedZone {
    pub origin: Name,
    pub data: Ip4Set,
}

/// Immutable dataset consulted to answer queries.
#[derive(Debug, Clone)]
pub struct ZoneSnapshot {
    zones: Vec<LoadedZone>,
    stamps: Vec<FileStamp>,
    generation: u64,
    loaded_at: Option<DateTime<Utc>>,
}

impl ZoneSnapshot {
    /// The snapshot served before the first successful load (quickstart).
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            zones: Vec::new(),
            stamps: Vec::new(),
            generation: 0,
            loaded_at: None,
        }
    }

    /// Load counter; 0 means nothing has been loaded yet.
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    #[must_use]
    pub const fn loaded_at(&self) -> Option<DateTime<Utc>> {
        self.loaded_at
    }

    #[must_use]
    pub fn zones(&self) -> &[LoadedZone] {
        &self.zones
    }

    #[must_use]
    pub fn stamps(&self) -> &[FileStamp] {
        &self.stamps
    }

    /// Total entries over all zones.
    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.zones.iter().map(|z| z.data.len()).sum()
    }

    /// The deepest zone containing `qname`.
    #[must_use]
    pub fn find_zone(&self, qname: &Name) -> Option<&LoadedZone> {
        self.zones
            .iter()
            .filter(|z| z.origin.zone_of(qname))
            .max_by_key(|z| z.origin.num_labels())
    }
}

/// Whether a load happens before the server starts answering or while it runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadPhase {
    /// Initial load: every failure is fatal.
    Startup,
    /// Periodic or requested reload: failures keep the previous snapshot.
    Runtime,
}

/// Result of asking the zone subsystem to refresh.
#[derive(Debug)]
pub enum ReloadStatus {
    /// No source changed since the current snapshot was built.
    Unchanged,
    /// A source could not be read; the current snapshot stays.
    Failed(SrvError),
    /// A new snapshot was built.
    Updated(ZoneSnapshot),
}

/// The zone subsystem as seen by the reload controller.
pub trait ZoneSource: Send + Sync {
    /// Build a new snapshot if any source changed since `current`.
    ///
    /// Must be safe to call repeatedly and must not modify `current`.
    fn reload_all(&self, current: &ZoneSnapshot, phase: LoadPhase) -> ReloadStatus;
}

/// File-backed zones declared on the command line or in the config file.
#[derive(Debug, Clone)]
pub struct ZoneSet {
    specs: Vec<ZoneSpec>,
    policy: CidrPolicy,
}

impl ZoneSet {
    #[must_use]
    pub const fn new(specs: Vec<ZoneSpec>, policy: CidrPolicy) -> Self {
        Self { specs, policy }
    }

    fn stamp_all(&self) -> crate::Result<Vec<FileStamp>> {
        self.specs
            .iter()
            .flat_map(|z| z.files.iter())
            .map(|f| FileStamp::read(f))
            .collect()
    }

    fn load_zone(&self, spec: &ZoneSpec) -> crate::Result<Ip4Set> {
        let zone = spec.origin.to_string();
        let mut data = Ip4Set::new();
        for file in &spec.files {
            let skipped = data.load_file(file, self.policy, &zone)?;
            if skipped > 0 {
                warn!(zone = %zone, file = %file.display(), skipped, "skipped invalid lines");
            }
        }
        Ok(data)
    }

    /// Build the next snapshot with `load` supplying each zone's data.
    fn build_snapshot<F>(
        &self,
        stamps: Vec<FileStamp>,
        generation: u64,
        phase: LoadPhase,
        load: F,
    ) -> ReloadStatus
    where
        F: Fn(&ZoneSpec) -> crate::Result<Ip4Set>,
    {
        let mut zones = Vec::with_capacity(self.specs.len());
        for spec in &self.specs {
            let data = match load(spec) {
                Ok(data) => data,
                Err(e) if e.is_exhaustion() && phase == LoadPhase::Runtime => {
                    warn!(
                        zone = %spec.origin,
                        "out of memory loading zone (zone will be empty)"
                    );
                    Ip4Set::new()
                }
                Err(e) => return ReloadStatus::Failed(e),
            };
            debug!(zone = %spec.origin, entries = data.len(), "zone loaded");
            zones.push(LoadedZone {
                origin: spec.origin.clone(),
                data,
            });
        }

        ReloadStatus::Updated(ZoneSnapshot {
            zones,
            stamps,
            generation,
            loaded_at: Some(Utc::now()),
        })
    }
}

impl ZoneSource for ZoneSet {
    fn reload_all(&self, current: &ZoneSnapshot, phase: LoadPhase) -> ReloadStatus {
        let stamps = match self.stamp_all() {
            Ok(s) => s,
            Err(e) => return ReloadStatus::Failed(e),
        };
        if current.generation > 0 && stamps == current.stamps {
            debug!(generation = current.generation, "zone files unchanged");
            return ReloadStatus::Unchanged;
        }

        self.build_snapshot(stamps, current.generation + 1, phase, |spec| {
            self.load_zone(spec)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;

    fn zone_file(contents: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        f
    }

    #[test]
    fn test_parse_zone_specs_merges_names() {
        let specs = parse_zone_specs(&[
            "bl.example.org:ip4set:a.txt,b.txt",
            "BL.example.org.:ip4set:c.txt",
            "dul.example.org:ip4set:d.txt",
        ])
        .unwrap();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].origin.to_string(), "bl.example.org.");
        assert_eq!(specs[0].files.len(), 3);
        assert_eq!(specs[1].files, vec![PathBuf::from("d.txt")]);
    }

    #[test]
    fn test_parse_zone_specs_errors() {
        assert!(parse_zone_specs(&["bl.example.org"]).is_err());
        assert!(parse_zone_specs(&["bl.example.org:dnset:a"]).is_err());
        assert!(parse_zone_specs(&["bl.example.org:ip4set:"]).is_err());
        assert!(parse_zone_specs(&[":ip4set:a"]).is_err());
    }

    #[test]
    fn test_reload_cycle() {
        let file = zone_file("192.0.2.1\n");
        let spec = format!("bl.example.org:ip4set:{}", file.path().display());
        let set = ZoneSet::new(parse_zone_specs(&[spec]).unwrap(), CidrPolicy::Strict);

        let ReloadStatus::Updated(first) =
            set.reload_all(&ZoneSnapshot::empty(), LoadPhase::Startup)
        else {
            panic!("initial load should build a snapshot");
        };
        assert_eq!(first.generation(), 1);
        assert_eq!(first.entry_count(), 1);

        assert!(matches!(
            set.reload_all(&first, LoadPhase::Runtime),
            ReloadStatus::Unchanged
        ));

        let mut f = std::fs::OpenOptions::new().append(true).open(file.path()).unwrap();
        f.write_all(b"192.0.2.2\n").unwrap();
        f.set_modified(SystemTime::now() + Duration::from_secs(5)).unwrap();

        let ReloadStatus::Updated(second) = set.reload_all(&first, LoadPhase::Runtime) else {
            panic!("changed file should rebuild");
        };
        assert_eq!(second.generation(), 2);
        assert_eq!(second.entry_count(), 2);
        // The previous snapshot is untouched.
        assert_eq!(first.entry_count(), 1);
    }

    #[test]
    fn test_missing_file_fails() {
        let set = ZoneSet::new(
            parse_zone_specs(&["bl.example.org:ip4set:/nonexistent/rbldns.zone"]).unwrap(),
            CidrPolicy::Strict,
        );
        assert!(matches!(
            set.reload_all(&ZoneSnapshot::empty(), LoadPhase::Startup),
            ReloadStatus::Failed(SrvError::Reload(_))
        ));
    }

    #[test]
    fn test_find_zone_prefers_deepest() {
        let a = zone_file("192.0.2.1\n");
        let b = zone_file("192.0.2.2\n");
        let specs = parse_zone_specs(&[
            format!("example.org:ip4set:{}", a.path().display()),
            format!("bl.example.org:ip4set:{}", b.path().display()),
        ])
        .unwrap();
        let set = ZoneSet::new(specs, CidrPolicy::Strict);
        let ReloadStatus::Updated(snap) =
            set.reload_all(&ZoneSnapshot::empty(), LoadPhase::Startup)
        else {
            panic!("load failed");
        };

        let q = Name::from_ascii("2.2.0.192.bl.example.org.").unwrap();
        assert_eq!(snap.find_zone(&q).unwrap().origin.to_string(), "bl.example.org.");
        let q = Name::from_ascii("1.2.0.192.example.org.").unwrap();
        assert_eq!(snap.find_zone(&q).unwrap().origin.to_string(), "example.org.");
        assert!(snap.find_zone(&Name::from_ascii("example.net.").unwrap()).is_none());
    }

    fn two_zones() -> (ZoneSet, tempfile::NamedTempFile, tempfile::NamedTempFile) {
        let a = zone_file("192.0.2.1\n");
        let b = zone_file("192.0.2.2\n192.0.2.3\n");
        let specs = parse_zone_specs(&[
            format!("bl.example.org:ip4set:{}", a.path().display()),
            format!("dul.example.org:ip4set:{}", b.path().display()),
        ])
        .unwrap();
        (ZoneSet::new(specs, CidrPolicy::Strict), a, b)
    }

    /// Loads normally except for `dul.example.org`, which runs out of memory.
    fn starve_dul(set: &ZoneSet, spec: &ZoneSpec) -> crate::Result<Ip4Set> {
        if spec.origin.to_string() == "dul.example.org." {
            return Err(SrvError::ResourceExhaustion(spec.origin.to_string()));
        }
        set.load_zone(spec)
    }

    #[test]
    fn test_runtime_exhaustion_leaves_zone_empty() {
        let (set, _a, _b) = two_zones();
        let stamps = set.stamp_all().unwrap();

        let ReloadStatus::Updated(snap) =
            set.build_snapshot(stamps, 2, LoadPhase::Runtime, |spec| starve_dul(&set, spec))
        else {
            panic!("runtime exhaustion should still install a snapshot");
        };
        assert_eq!(snap.generation(), 2);
        assert_eq!(snap.zones().len(), 2);
        assert_eq!(snap.zones()[0].data.len(), 1);
        assert!(snap.zones()[1].data.is_empty());
        assert_eq!(snap.entry_count(), 1);
    }

    #[test]
    fn test_startup_exhaustion_is_fatal() {
        let (set, _a, _b) = two_zones();
        let stamps = set.stamp_all().unwrap();

        assert!(matches!(
            set.build_snapshot(stamps, 1, LoadPhase::Startup, |spec| starve_dul(&set, spec)),
            ReloadStatus::Failed(SrvError::ResourceExhaustion(_))
        ));
    }

    #[test]
    fn test_runtime_read_error_is_not_degraded() {
        let (set, _a, _b) = two_zones();
        let stamps = set.stamp_all().unwrap();

        let status = set.build_snapshot(stamps, 2, LoadPhase::Runtime, |_| {
            Err(SrvError::Reload("permission denied".into()))
        });
        assert!(matches!(status, ReloadStatus::Failed(SrvError::Reload(_))));
    }
}
