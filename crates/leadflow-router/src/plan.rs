//! Sequence planning. Turns a classified lead into timed send requests.
//!
//! `send_at(k) = intake_time + offset(k)`. Offsets are validated (strictly
//! increasing, fast mode already applied) when the plan is built from config.

use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;

use leadflow_core::config::SequenceConfig;
use leadflow_core::error::Result;
use leadflow_core::types::{Lead, Segment, SendRequest};

use crate::templates::TemplateRouter;

#[derive(Debug, Clone)]
pub struct SequencePlan {
    offsets: Vec<Duration>,
    fast_mode: bool,
}

/// One step ready to hand to the scheduling collaborator.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledSend {
    pub send_at: DateTime<Utc>,
    pub request: SendRequest,
}

impl ScheduledSend {
    pub fn step(&self) -> u8 {
        self.request.step
    }

    pub fn template_id(&self) -> &str {
        &self.request.template_id
    }
}

impl SequencePlan {
    pub fn from_config(config: &SequenceConfig) -> Result<Self> {
        Ok(Self {
            offsets: config.scaled_offsets()?,
            fast_mode: config.fast_mode,
        })
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    pub fn is_fast_mode(&self) -> bool {
        self.fast_mode
    }

    /// Offset of `step` (1-based) from intake time.
    pub fn offset(&self, step: u8) -> Option<Duration> {
        (step as usize)
            .checked_sub(1)
            .and_then(|i| self.offsets.get(i))
            .copied()
    }

    /// Lazily yield the lead's send requests in step order.
    pub fn build_schedule<'a>(
        &'a self,
        router: &'a TemplateRouter,
        lead: &Lead,
        segment: Segment,
        intake_time: DateTime<Utc>,
    ) -> Schedule<'a> {
        Schedule {
            plan: self,
            router,
            segment,
            intake_time,
            identity: lead.identity(),
            email: lead.email.trim().to_string(),
            variables: lead.template_variables(segment),
            next_step: 1,
        }
    }
}

/// Finite, single-pass iterator over a lead's sequence.
pub struct Schedule<'a> {
    plan: &'a SequencePlan,
    router: &'a TemplateRouter,
    segment: Segment,
    intake_time: DateTime<Utc>,
    identity: String,
    email: String,
    variables: BTreeMap<String, String>,
    next_step: u8,
}

impl Iterator for Schedule<'_> {
    type Item = ScheduledSend;

    fn next(&mut self) -> Option<Self::Item> {
        let step = self.next_step;
        let offset = self.plan.offset(step)?;
        let template_id = self.router.resolve_template(self.segment, step)?;
        self.next_step += 1;

        let mut variables = self.variables.clone();
        variables.insert("step".into(), step.to_string());

        Some(ScheduledSend {
            send_at: self.intake_time + offset,
            request: SendRequest {
                identity: self.identity.clone(),
                email: self.email.clone(),
                step,
                template_id: template_id.to_string(),
                variables,
            },
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.plan.len().saturating_sub(self.next_step as usize - 1);
        (0, Some(left))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use leadflow_core::types::SystemCounts;

    fn lead() -> Lead {
        Lead {
            email: "a@x.com".into(),
            first_name: "Ari".into(),
            business_name: "Ari Plumbing".into(),
            assessment_score: 35,
            counts: SystemCounts::new(2, 1, 1, 0),
            weakest_systems: vec![],
            revenue_leak_total: None,
        }
    }

    #[test]
    fn test_seven_strictly_increasing_sends() {
        let plan = SequencePlan::from_config(&SequenceConfig::default()).unwrap();
        let router = TemplateRouter::default();
        let now = Utc::now();

        let sends: Vec<_> = plan
            .build_schedule(&router, &lead(), Segment::Critical, now)
            .collect();
        assert_eq!(sends.len(), 7);
        assert_eq!(sends[0].send_at, now);
        assert_eq!(sends[1].send_at, now + Duration::hours(24));
        assert!(sends.windows(2).all(|w| w[0].send_at < w[1].send_at));
        assert_eq!(sends[0].template_id(), "seq-1-critical-results");
        assert_eq!(sends[0].request.identity, "a@x.com");
        assert_eq!(sends[3].request.variables["step"], "4");
        let steps: Vec<u8> = sends.iter().map(|s| s.step()).collect();
        assert_eq!(steps, vec![1, 2, 3, 4, 5, 6, 7]);
    }

    #[test]
    fn test_schedule_is_single_pass() {
        let plan = SequencePlan::from_config(&SequenceConfig::default()).unwrap();
        let router = TemplateRouter::default();
        let mut schedule = plan.build_schedule(&router, &lead(), Segment::Optimize, Utc::now());
        assert_eq!(schedule.by_ref().count(), 7);
        assert!(schedule.next().is_none());
    }

    #[test]
    fn test_fast_mode_compresses_cadence() {
        let plan = SequencePlan::from_config(&SequenceConfig {
            fast_mode: true,
            ..Default::default()
        })
        .unwrap();
        assert!(plan.is_fast_mode());
        let router = TemplateRouter::default();
        let now = Utc::now();
        let last = plan
            .build_schedule(&router, &lead(), Segment::Urgent, now)
            .last()
            .unwrap();
        assert_eq!(last.send_at, now + Duration::minutes(14));
    }

    #[test]
    fn test_offset_lookup_bounds() {
        let plan = SequencePlan::from_config(&SequenceConfig::default()).unwrap();
        assert_eq!(plan.offset(0), None);
        assert_eq!(plan.offset(1), Some(Duration::zero()));
        assert_eq!(plan.offset(8), None);
    }
}
