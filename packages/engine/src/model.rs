// ABOUTME: Declarative environment model accumulated by template executions
// ABOUTME: Per-template contributions and the merged, runtime-free model of one environment

use crate::error::ModelError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

pub const DEFAULT_RETRY_LIMIT: u32 = 5;
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(2);

/// Everything one template invocation declared, including its imports
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TemplateModel {
    pub template: String,
    /// Distinguishes repeated invocations of the same template
    pub instance: String,
    pub images: Vec<ImageDecl>,
    pub imports: Vec<TemplateModel>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImageDecl {
    /// Image reference for fetched images, local name for built ones
    pub name: String,
    pub source: ImageSource,
    pub containers: Vec<ContainerDecl>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ImageSource {
    Fetch,
    Build(Workspace),
}

/// Build context staging area of a built image
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Workspace {
    pub files: BTreeMap<String, WorkspaceFile>,
    /// file name -> substitution map applied during resolution
    pub substitutions: BTreeMap<String, BTreeMap<String, String>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkspaceFile {
    pub content: Vec<u8>,
    pub mode: u32,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerDecl {
    pub name: String,
    pub ports: Vec<u16>,
    pub env: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    pub cmd: Vec<String>,
    pub entrypoint: Option<String>,
    pub mounts: Vec<Mount>,
    pub checks: Vec<CheckSpec>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Mount {
    pub dest: String,
    pub content: Vec<u8>,
    pub mode: u32,
    pub interpolate: bool,
    pub readonly: bool,
}

/// Readiness check as declared, before placeholder resolution
#[derive(Debug, Clone, PartialEq)]
pub struct CheckSpec {
    pub kind: CheckKind,
    pub retry_limit: u32,
    pub retry_interval: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum CheckKind {
    Net {
        protocol: String,
        address: String,
    },
    Http {
        url: String,
        /// Empty accepts any status
        codes: Vec<u16>,
        /// Regular expression the response body must match
        body: Option<String>,
    },
}

/// One image of the merged model with its runtime tag
#[derive(Debug, Clone, PartialEq)]
pub struct ModelImage {
    pub template: String,
    pub instance: String,
    pub name: String,
    pub tag: String,
    pub workspace: Option<Workspace>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelContainer {
    pub template: String,
    pub instance: String,
    /// Index into `MergedModel::images`
    pub image: usize,
    pub decl: ContainerDecl,
}

/// All template contributions of one environment, flattened
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergedModel {
    pub images: Vec<ModelImage>,
    pub containers: Vec<ModelContainer>,
}

impl MergedModel {
    /// Flatten successful contributions, imports after their parent.
    ///
    /// Container names must be unique across the whole environment.
    pub fn merge(env_id: &str, models: Vec<TemplateModel>) -> Result<Self, ModelError> {
        Self::merge_onto(&MergedModel::default(), env_id, models)
    }

    /// Merge `models` as an addition to `existing`, returning only the addition.
    ///
    /// New container names must not clash with each other or with `existing`.
    pub fn merge_onto(
        existing: &MergedModel,
        env_id: &str,
        models: Vec<TemplateModel>,
    ) -> Result<Self, ModelError> {
        let mut merged = MergedModel::default();
        let mut owners: HashMap<String, String> = existing
            .containers
            .iter()
            .map(|c| (c.decl.name.clone(), c.template.clone()))
            .collect();

        let mut pending: Vec<TemplateModel> = models.into_iter().rev().collect();
        while let Some(model) = pending.pop() {
            for image in model.images {
                let (tag, workspace) = match image.source {
                    ImageSource::Fetch => (image.name.clone(), None),
                    ImageSource::Build(ws) => (
                        built_image_tag(&model.template, &image.name, env_id, &model.instance),
                        Some(ws),
                    ),
                };

                let index = merged.images.len();
                merged.images.push(ModelImage {
                    template: model.template.clone(),
                    instance: model.instance.clone(),
                    name: image.name,
                    tag,
                    workspace,
                });

                for decl in image.containers {
                    if let Some(first) = owners.get(&decl.name) {
                        return Err(ModelError::DuplicateContainer {
                            name: decl.name,
                            first: first.clone(),
                            second: model.template.clone(),
                        });
                    }
                    owners.insert(decl.name.clone(), model.template.clone());

                    merged.containers.push(ModelContainer {
                        template: model.template.clone(),
                        instance: model.instance.clone(),
                        image: index,
                        decl,
                    });
                }
            }

            pending.extend(model.imports.into_iter().rev());
        }

        Ok(merged)
    }

    pub fn container(&self, name: &str) -> Option<&ModelContainer> {
        self.containers.iter().find(|c| c.decl.name == name)
    }

    /// Append an addition produced by `merge_onto`
    pub fn append(&mut self, addition: MergedModel) {
        let offset = self.images.len();
        self.images.extend(addition.images);
        self.containers
            .extend(addition.containers.into_iter().map(|mut c| {
                c.image += offset;
                c
            }));
    }

    /// Give containers that declared no ports the ports their image exposes
    pub fn expose_image_ports(&mut self, image_ports: &HashMap<String, Vec<u16>>) {
        for container in self.containers.iter_mut().filter(|c| c.decl.ports.is_empty()) {
            if let Some(ports) = image_ports.get(&self.images[container.image].tag) {
                container.decl.ports = ports.clone();
            }
        }
    }

    /// Distinct image tags of containers that declared no ports
    pub fn portless_images(&self) -> Vec<&str> {
        let mut tags: Vec<&str> = Vec::new();
        for container in self.containers.iter().filter(|c| c.decl.ports.is_empty()) {
            let tag = self.images[container.image].tag.as_str();
            if !tags.contains(&tag) {
                tags.push(tag);
            }
        }
        tags
    }

    /// Distinct references of fetched images, in declaration order
    pub fn fetched_references(&self) -> Vec<&str> {
        let mut refs: Vec<&str> = Vec::new();
        for image in self.images.iter().filter(|i| i.workspace.is_none()) {
            if !refs.contains(&image.tag.as_str()) {
                refs.push(&image.tag);
            }
        }
        refs
    }
}

/// `envforge-<template>-<image>:<env-id>-<instance>`
pub fn built_image_tag(template: &str, image: &str, env_id: &str, instance: &str) -> String {
    format!(
        "envforge-{}-{}:{}-{}",
        repository_component(template),
        repository_component(image),
        env_id,
        instance
    )
}

fn repository_component(raw: &str) -> String {
    raw.chars()
        .map(|c| match c.to_ascii_lowercase() {
            c @ ('a'..='z' | '0'..='9' | '.' | '_' | '-') => c,
            _ => '-',
        })
        .collect()
}
