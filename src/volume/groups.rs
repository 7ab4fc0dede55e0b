//! Supplemental-group range discovery and sampling.
//!
//! Every provisioned directory is grouped to a gid drawn from the ranges the
//! cluster allows this pod to assign. The ranges come from the pod security
//! policy the pod validated against; when no policy is readable, from the pod
//! namespace's preallocated-group annotations; and as a last resort from a
//! single permissive default range.

use std::path::Path;

use k8s_openapi::api::policy::v1beta1::PodSecurityPolicy;
use rand::Rng;
use tracing::{debug, info};

use crate::cluster::ClusterOps;
use crate::error::{Error, Result};

/// Downward-API file carrying the pod's annotations.
pub const DOWNWARD_ANNOTATIONS: &str = "/podinfo/annotations";

/// Annotation naming the pod security policy the pod validated against.
pub const VALIDATED_PSP_ANNOTATION: &str = "kubernetes.io/psp";

/// Preallocated supplemental groups of a namespace.
pub const SUPPLEMENTAL_GROUPS_ANNOTATION: &str = "openshift.io/sa.scc.supplemental-groups";

/// Fallback namespace annotation when the supplemental-groups one is absent.
pub const UID_RANGE_ANNOTATION: &str = "openshift.io/sa.scc.uid-range";

const MUST_RUN_AS: &str = "MustRunAs";

/// An inclusive range of group ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdRange {
    pub min: i64,
    pub max: i64,
}

impl IdRange {
    /// The range used when the cluster imposes no gid rules.
    pub fn default_range() -> Self {
        IdRange { min: 0, max: 65533 }
    }
}

/// Draw a supplemental group: a uniformly random range, then a uniformly
/// random value within it.
pub fn pick_group(ranges: &[IdRange]) -> Result<i64> {
    if ranges.is_empty() {
        return Err(Error::Internal(
            "no supplemental group ranges to pick from".to_string(),
        ));
    }
    let mut rng = rand::thread_rng();
    let range = ranges[rng.gen_range(0..ranges.len())];
    if range.min > range.max {
        return Err(Error::Internal(format!(
            "invalid supplemental group range {}-{}",
            range.min, range.max
        )));
    }
    Ok(rng.gen_range(range.min..=range.max))
}

/// Resolve the gid ranges this provisioner may assign. Never fails; the
/// fallbacks end at the permissive default range.
pub async fn discover_ranges(
    cluster: &dyn ClusterOps,
    namespace: Option<&str>,
    downward_annotations: &Path,
) -> Vec<IdRange> {
    match psp_ranges(cluster, downward_annotations).await {
        Ok(Some(ranges)) if !ranges.is_empty() => return ranges,
        Ok(_) => debug!("pod security policy imposes no gid range rules"),
        Err(e) => info!(error = %e, "couldn't read pod's security policy, trying namespace annotation"),
    }

    if let Some(namespace) = namespace {
        match namespace_ranges(cluster, namespace).await {
            Ok(Some(ranges)) if !ranges.is_empty() => return ranges,
            Ok(_) => debug!(namespace, "namespace carries no preallocated group annotation"),
            Err(e) => info!(error = %e, "couldn't read namespace group annotation"),
        }
    }

    info!("no gid ranges configured, falling back to the default range");
    vec![IdRange::default_range()]
}

/// Ranges from the pod security policy the pod validated against, if that
/// policy pins supplemental groups to MustRunAs.
async fn psp_ranges(
    cluster: &dyn ClusterOps,
    downward_annotations: &Path,
) -> Result<Option<Vec<IdRange>>> {
    let Some(name) = pod_annotation(downward_annotations, VALIDATED_PSP_ANNOTATION)? else {
        return Ok(None);
    };
    let Some(psp) = cluster.get_pod_security_policy(&name).await? else {
        return Ok(None);
    };
    Ok(supplemental_group_ranges(&psp))
}

/// The SupplementalGroup ranges of a policy, or None if it doesn't impose
/// gid range rules.
pub fn supplemental_group_ranges(psp: &PodSecurityPolicy) -> Option<Vec<IdRange>> {
    let groups = &psp.spec.as_ref()?.supplemental_groups;
    if groups.rule.as_deref() != Some(MUST_RUN_AS) {
        return None;
    }
    let ranges = groups.ranges.as_ref()?;
    Some(
        ranges
            .iter()
            .map(|r| IdRange { min: r.min, max: r.max })
            .collect(),
    )
}

/// Ranges preallocated to the pod's namespace, with the uid-range annotation
/// as a backwards compatible fallback.
async fn namespace_ranges(
    cluster: &dyn ClusterOps,
    namespace: &str,
) -> Result<Option<Vec<IdRange>>> {
    let Some(ns) = cluster.get_namespace(namespace).await? else {
        return Ok(None);
    };
    let annotations = ns.metadata.annotations.as_ref();
    let Some(groups) = annotations
        .and_then(|a| a.get(SUPPLEMENTAL_GROUPS_ANNOTATION))
        .or_else(|| annotations.and_then(|a| a.get(UID_RANGE_ANNOTATION)))
    else {
        return Ok(None);
    };
    parse_group_annotation(groups).map(Some)
}

/// Parse a preallocated-group annotation: comma-separated blocks, each either
/// `<start>/<length>` or `<start>-<end>`.
pub fn parse_group_annotation(groups: &str) -> Result<Vec<IdRange>> {
    let mut ranges = Vec::new();
    for segment in groups.split(',') {
        let segment = segment.trim();
        if segment.is_empty() {
            continue;
        }
        let range = if let Some((start, length)) = segment.split_once('/') {
            let start: i64 = start
                .trim()
                .parse()
                .map_err(|e| Error::Config(format!("bad group block {segment}: {e}")))?;
            let length: i64 = length
                .trim()
                .parse()
                .map_err(|e| Error::Config(format!("bad group block {segment}: {e}")))?;
            if length < 1 {
                return Err(Error::Config(format!("bad group block {segment}: empty block")));
            }
            IdRange {
                min: start,
                max: start + length - 1,
            }
        } else if let Some((min, max)) = segment.split_once('-') {
            let min: i64 = min
                .trim()
                .parse()
                .map_err(|e| Error::Config(format!("bad group block {segment}: {e}")))?;
            let max: i64 = max
                .trim()
                .parse()
                .map_err(|e| Error::Config(format!("bad group block {segment}: {e}")))?;
            if max < min {
                return Err(Error::Config(format!("bad group block {segment}: inverted")));
            }
            IdRange { min, max }
        } else {
            return Err(Error::Config(format!("bad group block {segment}")));
        };
        ranges.push(range);
    }
    if ranges.is_empty() {
        return Err(Error::Config(format!(
            "no blocks parsed from annotation {groups}"
        )));
    }
    Ok(ranges)
}

/// Value of the given annotation in the downward-API annotations file, or
/// None if the annotation isn't present.
pub fn pod_annotation(path: &Path, annotation: &str) -> Result<Option<String>> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("reading downward API annotations: {e}")))?;
    let prefix = format!("{annotation}=\"");
    for line in contents.lines() {
        if let Some(rest) = line.strip_prefix(&prefix) {
            if let Some(value) = rest.strip_suffix('"') {
                return Ok(Some(value.to_string()));
            }
        }
    }
    Ok(None)
}
