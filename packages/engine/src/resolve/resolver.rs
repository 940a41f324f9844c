// ABOUTME: Second resolution phase: placeholder substitution over a merged model
// ABOUTME: Produces runtime-ready container specs, build contexts and readiness checks

use super::placeholder::{self, Accessor, Expr, ParseError, Segment, Target};
use super::ports::PortAllocation;
use crate::error::ResolutionError;
use crate::model::{CheckKind, CheckSpec, MergedModel, ModelContainer, ModelImage, Workspace};
use crate::readiness::{Probe, ResolvedCheck};
use envforge_runtime::{BuildContext, BuildFile, ContainerSpec, FileMount, ENV_LABEL};
use regex::Regex;
use std::collections::BTreeMap;

type Result<T> = std::result::Result<T, ResolutionError>;

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedImage {
    pub template: String,
    pub instance: String,
    pub tag: String,
    /// Build context for built images, `None` for fetched ones
    pub build: Option<BuildContext>,
}

#[derive(Debug, Clone)]
pub struct ResolvedContainer {
    pub name: String,
    pub template: String,
    pub instance: String,
    pub spec: ContainerSpec,
    pub checks: Vec<ResolvedCheck>,
}

/// Fully substituted environment, ready to hand to a runtime
#[derive(Debug, Clone, Default)]
pub struct ResolvedEnvironment {
    pub images: Vec<ResolvedImage>,
    pub containers: Vec<ResolvedContainer>,
}

impl ResolvedEnvironment {
    pub fn container(&self, name: &str) -> Option<&ResolvedContainer> {
        self.containers.iter().find(|c| c.name == name)
    }

    pub fn extend(&mut self, other: ResolvedEnvironment) {
        self.images.extend(other.images);
        self.containers.extend(other.containers);
    }
}

/// Runtime name of a container inside an environment
pub fn runtime_name(env_id: &str, container: &str) -> String {
    format!("{}-{}", env_id, container)
}

/// Network joined by every container of an environment
pub fn network_name(env_id: &str) -> String {
    format!("envforge-{}", env_id)
}

struct Resolver<'a> {
    model: &'a MergedModel,
    ports: &'a PortAllocation,
    external_address: &'a str,
    env_id: &'a str,
}

impl<'a> Resolver<'a> {
    fn target(&self, current: &'a ModelContainer, target: &Target) -> Result<&'a ModelContainer> {
        let name = &current.decl.name;
        match target {
            Target::Current => Ok(current),
            Target::Named(other) => {
                self.model
                    .container(other)
                    .ok_or_else(|| ResolutionError::UnknownContainer {
                        container: name.clone(),
                        target: other.clone(),
                    })
            }
            Target::Labelled { key, value } => self
                .model
                .containers
                .iter()
                .find(|c| {
                    c.decl
                        .labels
                        .get(key)
                        .is_some_and(|v| value.is_empty() || v == value)
                })
                .ok_or_else(|| ResolutionError::NoContainerWithLabel {
                    container: name.clone(),
                    label: key.clone(),
                    value: value.clone(),
                }),
        }
    }

    fn access(
        &self,
        current: &ModelContainer,
        target: &ModelContainer,
        accessor: &Accessor,
    ) -> Result<String> {
        let name = &target.decl.name;
        match accessor {
            Accessor::ExposedPort(port) => self
                .ports
                .host_port(name, *port)
                .map(|p| p.to_string())
                .ok_or_else(|| ResolutionError::UnknownPort {
                    container: current.decl.name.clone(),
                    target: name.clone(),
                    port: *port,
                }),
            Accessor::Hostname => Ok(name.clone()),
            Accessor::Name => Ok(runtime_name(self.env_id, name)),
            Accessor::GetLabel(label) => {
                target
                    .decl
                    .labels
                    .get(label)
                    .cloned()
                    .ok_or_else(|| ResolutionError::UnknownLabel {
                        container: current.decl.name.clone(),
                        target: name.clone(),
                        label: label.clone(),
                    })
            }
        }
    }

    /// Substitute every placeholder of `input` in the scope of `current`
    fn interpolate(&self, current: &'a ModelContainer, input: &str) -> Result<String> {
        if !placeholder::has_placeholders(input) {
            return Ok(input.to_string());
        }

        let container = &current.decl.name;
        let segments = placeholder::parse(input).map_err(|e| match e {
            ParseError::Unknown(token) => ResolutionError::UnknownPlaceholder {
                container: container.clone(),
                token,
            },
            ParseError::Malformed(reason) => ResolutionError::Malformed {
                container: container.clone(),
                input: input.to_string(),
                reason,
            },
        })?;

        let mut out = String::with_capacity(input.len());
        for segment in segments {
            match segment {
                Segment::Text(text) => out.push_str(&text),
                Segment::Placeholder { source, expr } => match expr {
                    Expr::ExternalAddress => out.push_str(self.external_address),
                    Expr::Container { target, accessor } => {
                        let target = self.target(current, &target)?;
                        out.push_str(&self.access(current, target, &accessor)?);
                    }
                    Expr::Field(_) => {
                        return Err(ResolutionError::UnknownPlaceholder {
                            container: container.clone(),
                            token: source,
                        })
                    }
                },
            }
        }
        Ok(out)
    }

    fn interpolate_bytes(&self, current: &'a ModelContainer, content: &[u8]) -> Result<Vec<u8>> {
        let text = std::str::from_utf8(content).map_err(|e| ResolutionError::Malformed {
            container: current.decl.name.clone(),
            input: String::from_utf8_lossy(content).into_owned(),
            reason: format!("interpolated content is not UTF-8: {}", e),
        })?;
        Ok(self.interpolate(current, text)?.into_bytes())
    }

    fn check(&self, current: &'a ModelContainer, spec: &CheckSpec) -> Result<ResolvedCheck> {
        let probe = match &spec.kind {
            CheckKind::Net { protocol, address } => Probe::Net {
                protocol: protocol.clone(),
                address: self.interpolate(current, address)?,
            },
            CheckKind::Http { url, codes, body } => {
                let body = match body {
                    Some(pattern) => {
                        let pattern = self.interpolate(current, pattern)?;
                        let regex =
                            Regex::new(&pattern).map_err(|e| ResolutionError::Malformed {
                                container: current.decl.name.clone(),
                                input: pattern.clone(),
                                reason: e.to_string(),
                            })?;
                        Some(regex)
                    }
                    None => None,
                };
                Probe::Http {
                    url: self.interpolate(current, url)?,
                    codes: codes.clone(),
                    body,
                }
            }
        };

        Ok(ResolvedCheck {
            probe,
            retry_limit: spec.retry_limit,
            retry_interval: spec.retry_interval,
        })
    }

    fn container(&self, current: &'a ModelContainer) -> Result<ResolvedContainer> {
        let decl = &current.decl;

        for &port in &decl.ports {
            if self.ports.host_port(&decl.name, port).is_none() {
                return Err(ResolutionError::UnknownPort {
                    container: decl.name.clone(),
                    target: decl.name.clone(),
                    port,
                });
            }
        }

        let mut env = BTreeMap::new();
        for (key, value) in &decl.env {
            env.insert(key.clone(), self.interpolate(current, value)?);
        }

        let mut files = Vec::with_capacity(decl.mounts.len());
        for mount in &decl.mounts {
            let content = if mount.interpolate {
                self.interpolate_bytes(current, &mount.content)?
            } else {
                mount.content.clone()
            };
            files.push(FileMount {
                path: mount.dest.clone(),
                content,
                mode: mount.mode,
                readonly: mount.readonly,
            });
        }

        let checks = decl
            .checks
            .iter()
            .map(|check| self.check(current, check))
            .collect::<Result<Vec<_>>>()?;

        let mut labels = decl.labels.clone();
        labels.insert(ENV_LABEL.to_string(), self.env_id.to_string());

        Ok(ResolvedContainer {
            name: decl.name.clone(),
            template: current.template.clone(),
            instance: current.instance.clone(),
            spec: ContainerSpec {
                name: runtime_name(self.env_id, &decl.name),
                hostname: decl.name.clone(),
                image: self.model.images[current.image].tag.clone(),
                env,
                labels,
                cmd: decl.cmd.clone(),
                entrypoint: decl.entrypoint.clone(),
                ports: self.ports.container_ports(&decl.name),
                files,
                network: Some(network_name(self.env_id)),
            },
            checks,
        })
    }
}

fn substitute_file(
    image: &str,
    file: &str,
    content: &[u8],
    values: &BTreeMap<String, String>,
) -> Result<Vec<u8>> {
    let malformed = |reason: String| ResolutionError::Malformed {
        container: image.to_string(),
        input: file.to_string(),
        reason,
    };

    let text = std::str::from_utf8(content)
        .map_err(|e| malformed(format!("workspace file is not UTF-8: {}", e)))?;
    let segments = placeholder::parse(text).map_err(|e| malformed(e.to_string()))?;

    let mut out = String::with_capacity(text.len());
    for segment in segments {
        match segment {
            Segment::Text(text) => out.push_str(&text),
            Segment::Placeholder {
                expr: Expr::Field(key),
                ..
            } => match values.get(&key) {
                Some(value) => out.push_str(value),
                None => {
                    return Err(ResolutionError::UnknownSubstitution {
                        file: file.to_string(),
                        key,
                    })
                }
            },
            Segment::Placeholder { source, .. } => {
                return Err(ResolutionError::UnknownSubstitution {
                    file: file.to_string(),
                    key: source,
                })
            }
        }
    }
    Ok(out.into_bytes())
}

fn build_context(image: &str, tag: &str, workspace: &Workspace) -> Result<BuildContext> {
    let mut files = Vec::with_capacity(workspace.files.len());
    for (path, file) in &workspace.files {
        let content = match workspace.substitutions.get(path) {
            Some(values) => substitute_file(image, path, &file.content, values)?,
            None => file.content.clone(),
        };
        files.push(BuildFile {
            path: path.clone(),
            content,
            mode: file.mode,
        });
    }

    Ok(BuildContext {
        tag: tag.to_string(),
        files,
    })
}

/// Produce build contexts for built images. Needs no port allocation.
pub fn resolve_images(images: &[ModelImage]) -> Result<Vec<ResolvedImage>> {
    images
        .iter()
        .map(|image| {
            let build = match &image.workspace {
                Some(ws) => Some(build_context(&image.name, &image.tag, ws)?),
                None => None,
            };
            Ok(ResolvedImage {
                template: image.template.clone(),
                instance: image.instance.clone(),
                tag: image.tag.clone(),
                build,
            })
        })
        .collect()
}

/// Resolve the containers named in `names`, with every container of `model`
/// visible to placeholders.
pub fn resolve_containers(
    model: &MergedModel,
    names: &[&str],
    ports: &PortAllocation,
    external_address: &str,
    env_id: &str,
) -> Result<Vec<ResolvedContainer>> {
    let resolver = Resolver {
        model,
        ports,
        external_address,
        env_id,
    };

    model
        .containers
        .iter()
        .filter(|c| names.contains(&c.decl.name.as_str()))
        .map(|c| resolver.container(c))
        .collect()
}

/// Substitute every placeholder of `model` against a finished port allocation.
///
/// The result depends only on its inputs, so resolving twice yields equal output.
pub fn resolve(
    model: &MergedModel,
    ports: &PortAllocation,
    external_address: &str,
    env_id: &str,
) -> Result<ResolvedEnvironment> {
    let names: Vec<&str> = model.containers.iter().map(|c| c.decl.name.as_str()).collect();

    Ok(ResolvedEnvironment {
        images: resolve_images(&model.images)?,
        containers: resolve_containers(model, &names, ports, external_address, env_id)?,
    })
}
