// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Launch configuration tree.

A [ConfigGroup] is a node holding launch settings plus child nodes whose
settings only apply when their condition holds for the running host.
[ConfigGroup::resolve] flattens a tree into a [ResolvedLaunch].

Each node is serialized as:

```text
u32  magic ("CONF")
     fields: (u8 id, payload)*, terminated by END
```

Module path and class path entries are [Reference] records:

```text
u8   magic (0x01)
u8   kind (LOCAL = 0, EXTERNAL = 1)
     nullable name
LOCAL:    u32 group index, u32 override count, (i32 release, u32 group index)*
EXTERNAL: nullable repository, group, artifact, version, classifier
```
*/

use {
    crate::{
        group::GroupSet,
        serialization::{
            write_nullable_string, write_string, write_string_list, ByteReader, ConfigField,
            ReferenceKind, CONFIG_MAGIC, REFERENCE_MAGIC,
        },
        Error, PackedResult,
    },
    anyhow::{Context, Result},
    byteorder::{LittleEndian, WriteBytesExt},
    std::{convert::TryFrom, io::Write, path::PathBuf},
};

/// Maximum nesting of configuration groups.
const MAX_DEPTH: usize = 64;

/// Magic, kind and null name.
const MIN_REFERENCE_SIZE: usize = 6;

/// Magic and END.
const MIN_NODE_SIZE: usize = 5;

/// Facts about the host used to evaluate conditions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuntimeContext {
    pub os: String,
    pub arch: String,
    pub libc: Option<String>,
    /// Major version of the runtime, e.g. `17`.
    pub release: i32,
}

impl RuntimeContext {
    pub fn new(
        os: impl Into<String>,
        arch: impl Into<String>,
        libc: Option<String>,
        release: i32,
    ) -> Self {
        Self {
            os: os.into(),
            arch: arch.into(),
            libc,
            release,
        }
    }

    /// Describe the current host.
    pub fn from_host(release: i32) -> Self {
        let libc = if cfg!(target_env = "musl") {
            Some("musl".to_string())
        } else if cfg!(target_env = "gnu") {
            Some("gnu".to_string())
        } else {
            None
        };

        Self::new(std::env::consts::OS, std::env::consts::ARCH, libc, release)
    }
}

/// Decides whether a condition expression holds.
pub trait ConditionEvaluator {
    fn evaluate(&self, condition: &str, context: &RuntimeContext) -> bool;
}

impl<F> ConditionEvaluator for F
where
    F: Fn(&str, &RuntimeContext) -> bool,
{
    fn evaluate(&self, condition: &str, context: &RuntimeContext) -> bool {
        self(condition, context)
    }
}

/// Coordinates of an artifact stored outside the container.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExternalCoordinates {
    pub repository: Option<String>,
    pub group: Option<String>,
    pub artifact: Option<String>,
    pub version: Option<String>,
    pub classifier: Option<String>,
}

/// Locates external artifacts on the local filesystem.
pub trait ExternalReferenceResolver {
    fn resolve(&self, coordinates: &ExternalCoordinates) -> PackedResult<PathBuf>;
}

/// An entry on the module path or class path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reference {
    /// Resource groups stored in this container.
    Local {
        name: Option<String>,
        groups: GroupSet,
    },
    /// An artifact resolved at launch time.
    External {
        name: Option<String>,
        coordinates: ExternalCoordinates,
    },
}

impl Reference {
    pub fn name(&self) -> Option<&str> {
        match self {
            Self::Local { name, .. } | Self::External { name, .. } => name.as_deref(),
        }
    }

    pub fn read_from(reader: &mut ByteReader) -> PackedResult<Self> {
        let start = reader.position() as u64;

        let magic = reader.read_u8("reference magic")?;
        if magic != REFERENCE_MAGIC {
            return Err(Error::malformed(
                start,
                format!("bad reference magic 0x{:02x}", magic),
            ));
        }

        let kind = ReferenceKind::try_from(reader.read_u8("reference kind")?)?;
        let name = reader.read_nullable_string("reference name")?;

        match kind {
            ReferenceKind::Local => {
                let mut groups = GroupSet::new(reader.read_u32("group index")?);

                let count = reader.read_u32("release count")?;
                for _ in 0..count {
                    let offset = reader.position() as u64;
                    let release = reader.read_i32("release")?;
                    let group = reader.read_u32("release group index")?;

                    groups
                        .add_release(release, group)
                        .map_err(|e| e.offset_by(offset))?;
                }

                Ok(Self::Local { name, groups })
            }
            ReferenceKind::External => Ok(Self::External {
                name,
                coordinates: ExternalCoordinates {
                    repository: reader.read_nullable_string("repository")?,
                    group: reader.read_nullable_string("group")?,
                    artifact: reader.read_nullable_string("artifact")?,
                    version: reader.read_nullable_string("version")?,
                    classifier: reader.read_nullable_string("classifier")?,
                },
            }),
        }
    }

    pub fn write_to<W: Write>(&self, dest: &mut W) -> Result<()> {
        dest.write_u8(REFERENCE_MAGIC)
            .context("writing reference magic")?;

        match self {
            Self::Local { name, groups } => {
                dest.write_u8(ReferenceKind::Local.into())
                    .context("writing reference kind")?;
                write_nullable_string(dest, name.as_deref(), "reference name")?;
                dest.write_u32::<LittleEndian>(groups.base())
                    .context("writing group index")?;
                dest.write_u32::<LittleEndian>(groups.releases().len() as u32)
                    .context("writing release count")?;
                for (release, group) in groups.releases() {
                    dest.write_i32::<LittleEndian>(*release)
                        .context("writing release")?;
                    dest.write_u32::<LittleEndian>(*group)
                        .context("writing release group index")?;
                }
            }
            Self::External { name, coordinates } => {
                dest.write_u8(ReferenceKind::External.into())
                    .context("writing reference kind")?;
                write_nullable_string(dest, name.as_deref(), "reference name")?;
                for (value, what) in [
                    (&coordinates.repository, "repository"),
                    (&coordinates.group, "group"),
                    (&coordinates.artifact, "artifact"),
                    (&coordinates.version, "version"),
                    (&coordinates.classifier, "classifier"),
                ] {
                    write_nullable_string(dest, value.as_deref(), what)?;
                }
            }
        }

        Ok(())
    }
}

/// Add `source` to `target`, replacing named entries in place.
fn add_or_replace(target: &mut Vec<Reference>, source: &[Reference]) {
    for reference in source {
        let existing = reference
            .name()
            .and_then(|name| target.iter().position(|r| r.name() == Some(name)));

        match existing {
            Some(position) => target[position] = reference.clone(),
            None => target.push(reference.clone()),
        }
    }
}

/// A node of the launch configuration tree.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConfigGroup {
    /// Expression gating this node and its children.
    pub condition: Option<String>,
    pub main_class: Option<String>,
    pub main_module: Option<String>,
    pub module_path: Vec<Reference>,
    pub class_path: Vec<Reference>,
    pub jvm_properties: Vec<String>,
    pub add_reads: Vec<String>,
    pub add_exports: Vec<String>,
    pub add_opens: Vec<String>,
    pub enable_native_access: Vec<String>,
    pub sub_groups: Vec<ConfigGroup>,
}

impl ConfigGroup {
    pub fn new() -> Self {
        Self::default()
    }

    fn applies(&self, context: &RuntimeContext, evaluator: &dyn ConditionEvaluator) -> bool {
        match &self.condition {
            Some(condition) => evaluator.evaluate(condition, context),
            None => true,
        }
    }

    fn merge_into(
        &self,
        launch: &mut ResolvedLaunch,
        context: &RuntimeContext,
        evaluator: &dyn ConditionEvaluator,
    ) {
        add_or_replace(&mut launch.module_path, &self.module_path);
        add_or_replace(&mut launch.class_path, &self.class_path);
        launch.jvm_properties.extend(self.jvm_properties.iter().cloned());
        launch.add_reads.extend(self.add_reads.iter().cloned());
        launch.add_exports.extend(self.add_exports.iter().cloned());
        launch.add_opens.extend(self.add_opens.iter().cloned());
        launch
            .enable_native_access
            .extend(self.enable_native_access.iter().cloned());

        if self.main_class.is_some() {
            launch.main_class = self.main_class.clone();
        }
        if self.main_module.is_some() {
            launch.main_module = self.main_module.clone();
        }

        for child in &self.sub_groups {
            if child.applies(context, evaluator) {
                child.merge_into(launch, context, evaluator);
            }
        }
    }

    /// Flatten this tree for `context`.
    ///
    /// The root always applies. Children are visited in pre-order; a child
    /// whose condition is false is skipped along with its descendants.
    pub fn resolve(
        &self,
        context: &RuntimeContext,
        evaluator: &dyn ConditionEvaluator,
    ) -> ResolvedLaunch {
        let mut launch = ResolvedLaunch::default();
        self.merge_into(&mut launch, context, evaluator);
        launch
    }

    pub fn read_from(reader: &mut ByteReader) -> PackedResult<Self> {
        Self::read_nested(reader, 0)
    }

    fn read_nested(reader: &mut ByteReader, depth: usize) -> PackedResult<Self> {
        let start = reader.position() as u64;

        if depth > MAX_DEPTH {
            return Err(Error::malformed(start, "configuration groups nested too deeply"));
        }

        let magic = reader.read_u32("configuration magic")?;
        if magic != CONFIG_MAGIC {
            return Err(Error::malformed(
                start,
                format!("bad configuration magic 0x{:08x}", magic),
            ));
        }

        let mut group = Self::new();
        let mut seen = 0u16;

        loop {
            let field_offset = reader.position() as u64;
            let field = ConfigField::try_from(reader.read_u8("configuration field")?)?;

            let bit = 1u16 << u8::from(field);
            if seen & bit != 0 {
                return Err(Error::malformed(
                    field_offset,
                    format!("duplicate configuration field {:?}", field),
                ));
            }
            seen |= bit;

            match field {
                ConfigField::End => break,
                ConfigField::Condition => {
                    group.condition = Some(reader.read_string("condition")?);
                }
                ConfigField::MainClass => {
                    group.main_class = Some(reader.read_string("main class")?);
                }
                ConfigField::MainModule => {
                    group.main_module = Some(reader.read_string("main module")?);
                }
                ConfigField::ModulePath | ConfigField::ClassPath => {
                    let count = reader.read_count(MIN_REFERENCE_SIZE, "reference")?;
                    let references = (0..count)
                        .map(|_| Reference::read_from(reader))
                        .collect::<PackedResult<Vec<_>>>()?;

                    if field == ConfigField::ModulePath {
                        group.module_path = references;
                    } else {
                        group.class_path = references;
                    }
                }
                ConfigField::JvmProperties => {
                    group.jvm_properties = reader.read_string_list("JVM properties")?;
                }
                ConfigField::AddReads => {
                    group.add_reads = reader.read_string_list("add-reads")?;
                }
                ConfigField::AddExports => {
                    group.add_exports = reader.read_string_list("add-exports")?;
                }
                ConfigField::AddOpens => {
                    group.add_opens = reader.read_string_list("add-opens")?;
                }
                ConfigField::EnableNativeAccess => {
                    group.enable_native_access =
                        reader.read_string_list("enable-native-access")?;
                }
                ConfigField::SubGroups => {
                    let count = reader.read_count(MIN_NODE_SIZE, "sub group")?;
                    group.sub_groups = (0..count)
                        .map(|_| Self::read_nested(reader, depth + 1))
                        .collect::<PackedResult<Vec<_>>>()?;
                }
            }
        }

        Ok(group)
    }

    /// Serialize this tree. Empty fields are omitted.
    pub fn write_to<W: Write>(&self, dest: &mut W) -> Result<()> {
        dest.write_u32::<LittleEndian>(CONFIG_MAGIC)
            .context("writing configuration magic")?;

        for (field, value) in [
            (ConfigField::Condition, &self.condition),
            (ConfigField::MainClass, &self.main_class),
            (ConfigField::MainModule, &self.main_module),
        ] {
            if let Some(value) = value {
                dest.write_u8(field.into())
                    .context("writing configuration field")?;
                write_string(dest, value, "configuration string")?;
            }
        }

        for (field, references) in [
            (ConfigField::ModulePath, &self.module_path),
            (ConfigField::ClassPath, &self.class_path),
        ] {
            if !references.is_empty() {
                dest.write_u8(field.into())
                    .context("writing configuration field")?;
                dest.write_u32::<LittleEndian>(references.len() as u32)
                    .context("writing reference count")?;
                for reference in references {
                    reference.write_to(dest)?;
                }
            }
        }

        for (field, values) in [
            (ConfigField::JvmProperties, &self.jvm_properties),
            (ConfigField::AddReads, &self.add_reads),
            (ConfigField::AddExports, &self.add_exports),
            (ConfigField::AddOpens, &self.add_opens),
            (ConfigField::EnableNativeAccess, &self.enable_native_access),
        ] {
            if !values.is_empty() {
                dest.write_u8(field.into())
                    .context("writing configuration field")?;
                write_string_list(dest, values, "configuration list")?;
            }
        }

        if !self.sub_groups.is_empty() {
            dest.write_u8(ConfigField::SubGroups.into())
                .context("writing configuration field")?;
            dest.write_u32::<LittleEndian>(self.sub_groups.len() as u32)
                .context("writing sub group count")?;
            for child in &self.sub_groups {
                child.write_to(dest)?;
            }
        }

        dest.write_u8(ConfigField::End.into())
            .context("writing end of configuration")?;

        Ok(())
    }
}

/// A path entry with its storage resolved.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResolvedPath {
    /// Groups in this container, most specific release first.
    Local {
        name: Option<String>,
        groups: Vec<u32>,
    },
    External {
        name: Option<String>,
        path: PathBuf,
    },
}

/// Effective launch settings after condition evaluation.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResolvedLaunch {
    pub main_class: Option<String>,
    pub main_module: Option<String>,
    pub module_path: Vec<Reference>,
    pub class_path: Vec<Reference>,
    pub jvm_properties: Vec<String>,
    pub add_reads: Vec<String>,
    pub add_exports: Vec<String>,
    pub add_opens: Vec<String>,
    pub enable_native_access: Vec<String>,
}

fn resolve_paths(
    references: &[Reference],
    release: i32,
    resolver: &dyn ExternalReferenceResolver,
) -> PackedResult<Vec<ResolvedPath>> {
    references
        .iter()
        .map(|reference| match reference {
            Reference::Local { name, groups } => Ok(ResolvedPath::Local {
                name: name.clone(),
                groups: groups.groups_for(release),
            }),
            Reference::External { name, coordinates } => Ok(ResolvedPath::External {
                name: name.clone(),
                path: resolver.resolve(coordinates)?,
            }),
        })
        .collect()
}

impl ResolvedLaunch {
    /// Resolve module path entries for a runtime at `release`.
    ///
    /// Modules must be named.
    pub fn module_path_groups(
        &self,
        release: i32,
        resolver: &dyn ExternalReferenceResolver,
    ) -> PackedResult<Vec<ResolvedPath>> {
        if let Some(reference) = self
            .module_path
            .iter()
            .find(|r| matches!(r, Reference::Local { name: None, .. }))
        {
            return Err(Error::malformed(
                0,
                format!("module path entry has no name: {:?}", reference),
            ));
        }

        resolve_paths(&self.module_path, release, resolver)
    }

    /// Resolve class path entries for a runtime at `release`.
    pub fn class_path_groups(
        &self,
        release: i32,
        resolver: &dyn ExternalReferenceResolver,
    ) -> PackedResult<Vec<ResolvedPath>> {
        resolve_paths(&self.class_path, release, resolver)
    }
}
