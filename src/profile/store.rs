use std::fs;
use std::path::{Path, PathBuf};
use serde::{Deserialize, Serialize};

use super::{ProfileError, Result};

/// Name of the fallback profile. Never written to disk, never shown to clients.
pub const DEFAULT_PROFILE: &str = "";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub name: String,
    pub thresholds: Vec<i32>,
}

impl Profile {
    pub fn is_default(&self) -> bool {
        self.name == DEFAULT_PROFILE
    }

    /// `name v0 v1 ... v(N-1)`
    fn to_line(&self) -> String {
        let mut line = self.name.clone();
        for value in &self.thresholds {
            line.push(' ');
            line.push_str(&value.to_string());
        }
        line
    }

    /// Only lines with exactly `sensor_count + 1` tokens are profiles.
    fn parse_line(line: &str, sensor_count: usize) -> Option<Self> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() != sensor_count + 1 {
            return None;
        }
        let thresholds = parts[1..]
            .iter()
            .map(|token| token.parse::<i32>().ok())
            .collect::<Option<Vec<i32>>>()?;

        Some(Profile {
            name: parts[0].to_string(),
            thresholds,
        })
    }
}

/// Named threshold profiles backed by a flat text file.
///
/// Every profile has exactly `sensor_count` thresholds. The current-profile
/// pointer always names an existing profile; the default profile `""` is
/// the fallback. Each mutation rewrites the whole file.
#[derive(Debug, Clone)]
pub struct ProfileStore {
    path: PathBuf,
    sensor_count: usize,
    profiles: Vec<Profile>,
    current: String,
    writable: bool,
}

impl ProfileStore {
    pub fn new(path: impl Into<PathBuf>, sensor_count: usize) -> Self {
        Self {
            path: path.into(),
            sensor_count,
            profiles: vec![Profile {
                name: DEFAULT_PROFILE.to_string(),
                thresholds: vec![0; sensor_count],
            }],
            current: DEFAULT_PROFILE.to_string(),
            writable: true,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn sensor_count(&self) -> usize {
        self.sensor_count
    }

    /// Read profiles from disk, creating an empty file if there is none.
    /// The first profile in the file becomes current. Returns how many
    /// profiles were loaded.
    ///
    /// Lines that don't parse (including ones that aren't valid UTF-8) are
    /// skipped. If the file exists but can't be read, the store keeps
    /// working in memory and never writes the file.
    pub fn load(&mut self) -> Result<usize> {
        if !self.path.exists() {
            fs::File::create(&self.path)?;
            log::info!("Created empty profile file {}", self.path.display());
            return Ok(0);
        }

        let contents = match fs::read(&self.path) {
            Ok(contents) => contents,
            Err(e) => {
                self.writable = false;
                return Err(e.into());
            }
        };

        let mut loaded = 0;
        for (line_no, raw) in contents.split(|b| *b == b'\n').enumerate() {
            let Ok(line) = std::str::from_utf8(raw) else {
                log::warn!(
                    "Skipping non UTF-8 line {} in {}: {:?}",
                    line_no + 1,
                    self.path.display(),
                    String::from_utf8_lossy(raw)
                );
                continue;
            };
            if line.trim().is_empty() {
                continue;
            }
            match Profile::parse_line(line, self.sensor_count) {
                Some(profile) => {
                    let name = profile.name.clone();
                    self.upsert(profile);
                    loaded += 1;
                    if loaded == 1 {
                        self.change_profile(&name);
                    }
                }
                None => log::warn!(
                    "Skipping malformed line {} in {}: {:?}",
                    line_no + 1,
                    self.path.display(),
                    line
                ),
            }
        }

        log::info!("Found profiles: {:?}", self.profile_names());
        Ok(loaded)
    }

    pub fn current_profile(&self) -> &str {
        &self.current
    }

    /// Thresholds of the current profile
    pub fn current_thresholds(&self) -> &[i32] {
        match self.find(&self.current) {
            Some(profile) => &profile.thresholds,
            None => {
                log::warn!("Current profile {:?} missing, using default", self.current);
                &self.default_profile().thresholds
            }
        }
    }

    /// Set one slot of the current profile
    pub fn update_threshold(&mut self, index: usize, value: i32) -> Result<()> {
        if index >= self.sensor_count {
            return Err(ProfileError::IndexOutOfRange { index, len: self.sensor_count });
        }
        self.current_mut().thresholds[index] = value;
        self.save()
    }

    /// Replace the current profile's thresholds
    pub fn update_thresholds(&mut self, values: &[i32]) -> Result<()> {
        self.check_len(values)?;
        self.current_mut().thresholds = values.to_vec();
        self.save()
    }

    /// Switch to `name`. Unknown names leave the store untouched and return false.
    pub fn change_profile(&mut self, name: &str) -> bool {
        if self.find(name).is_none() {
            return false;
        }
        self.current = name.to_string();
        log::info!("Changed to profile {:?} with thresholds {:?}", self.current, self.current_thresholds());
        true
    }

    /// Insert or overwrite `name` and make it current
    pub fn add_profile(&mut self, name: &str, thresholds: Vec<i32>) -> Result<()> {
        if name.is_empty() || name.chars().any(char::is_whitespace) {
            return Err(ProfileError::InvalidName(name.to_string()));
        }
        self.check_len(&thresholds)?;

        self.upsert(Profile {
            name: name.to_string(),
            thresholds,
        });
        // Edits made while on the default profile were carried over into the
        // new profile; start the default from scratch again.
        if self.current == DEFAULT_PROFILE {
            let sensor_count = self.sensor_count;
            self.default_profile_mut().thresholds = vec![0; sensor_count];
        }
        self.change_profile(name);
        self.save()
    }

    /// Delete `name`, falling back to the default profile if it was current.
    /// Returns false for unknown names and for the default profile.
    pub fn remove_profile(&mut self, name: &str) -> Result<bool> {
        if name == DEFAULT_PROFILE {
            return Ok(false);
        }
        let Some(pos) = self.profiles.iter().position(|p| p.name == name) else {
            return Ok(false);
        };

        self.profiles.remove(pos);
        if self.current == name {
            self.change_profile(DEFAULT_PROFILE);
        }
        self.save()?;
        log::info!("Removed profile {:?}, current thresholds are {:?}", name, self.current_thresholds());
        Ok(true)
    }

    /// Named profiles in insertion order, default excluded
    pub fn profile_names(&self) -> Vec<String> {
        self.profiles
            .iter()
            .filter(|p| !p.is_default())
            .map(|p| p.name.clone())
            .collect()
    }

    pub fn get_profile(&self, name: &str) -> Option<&Profile> {
        self.find(name)
    }

    /// Rewrite the profile file
    pub fn save(&self) -> Result<()> {
        if !self.writable {
            return Err(ProfileError::ReadOnly(self.path.clone()));
        }
        let mut contents = String::new();
        for profile in self.profiles.iter().filter(|p| !p.is_default()) {
            contents.push_str(&profile.to_line());
            contents.push('\n');
        }
        fs::write(&self.path, contents)?;
        Ok(())
    }

    fn check_len(&self, values: &[i32]) -> Result<()> {
        if values.len() != self.sensor_count {
            return Err(ProfileError::LengthMismatch {
                expected: self.sensor_count,
                actual: values.len(),
            });
        }
        Ok(())
    }

    fn find(&self, name: &str) -> Option<&Profile> {
        self.profiles.iter().find(|p| p.name == name)
    }

    fn upsert(&mut self, profile: Profile) {
        match self.profiles.iter_mut().find(|p| p.name == profile.name) {
            Some(existing) => existing.thresholds = profile.thresholds,
            None => self.profiles.push(profile),
        }
    }

    fn default_profile(&self) -> &Profile {
        // The default profile is created in new() and can't be removed.
        &self.profiles[0]
    }

    fn default_profile_mut(&mut self) -> &mut Profile {
        &mut self.profiles[0]
    }

    fn current_mut(&mut self) -> &mut Profile {
        match self.profiles.iter().position(|p| p.name == self.current) {
            Some(pos) => &mut self.profiles[pos],
            None => {
                self.current = DEFAULT_PROFILE.to_string();
                self.default_profile_mut()
            }
        }
    }
}
