//! Demo sequences for development mode.

use campaign_core::CampaignResult;
use tracing::info;
use uuid::Uuid;

use crate::rendering::TemplateRenderer;
use crate::store::SequenceStore;
use crate::types::{Sequence, Step, TriggerType};

/// Installs two demo sequences and their templates. Returns the sequence ids.
pub async fn seed_demo_sequences(
    store: &dyn SequenceStore,
    renderer: &TemplateRenderer,
) -> CampaignResult<Vec<Uuid>> {
    info!("Seeding demo sequences");

    // ---- 1. Welcome Series ----
    renderer.register(
        "welcome_email",
        "Welcome aboard, {{first_name}}!",
        "Hi {{first_name}}, thanks for signing up. Here is how to get started.",
    );
    renderer.register(
        "getting_started",
        "Three things to try this week",
        "Hi {{first_name}}, here are three features most teams set up first.",
    );
    renderer.register(
        "premium_tour",
        "Your premium features",
        "Hi {{first_name}}, a quick tour of what your premium plan unlocks.",
    );
    renderer.register(
        "feedback_request",
        "How is it going?",
        "Hi {{first_name}}, reply to this email and tell us how your first week went.",
    );

    let welcome = Sequence::new("Welcome Series", TriggerType::Signup)
        .with_exit_tag("unsubscribed")
        .with_exit_on_reply()
        .with_step(Step::new("welcome_email"))
        .with_step(Step::new("getting_started").with_delay(2, 0))
        .with_step(Step::new("premium_tour").with_delay(1, 0).require_tag("premium"))
        .with_step(Step::new("feedback_request").with_delay(4, 0));

    // ---- 2. Trial Nurture ----
    renderer.register(
        "trial_day_one",
        "Your trial has started",
        "Hi {{first_name}}, your 14 day trial is live. Start with the setup checklist.",
    );
    renderer.register(
        "trial_midpoint",
        "Halfway through your trial",
        "Hi {{first_name}}, you're halfway through. Need a hand? Just reply.",
    );
    renderer.register(
        "trial_ending",
        "Your trial ends soon",
        "Hi {{first_name}}, your trial ends in two days. Upgrade to keep your data.",
    );

    let trial = Sequence::new(
        "Trial Nurture",
        TriggerType::TagAdded {
            tag: "trial".to_string(),
        },
    )
    .with_priority(10)
    .with_exit_tag("customer")
    .with_exit_on_reply()
    .with_step(Step::new("trial_day_one").with_delay(0, 1))
    .with_step(Step::new("trial_midpoint").with_delay(7, 0))
    .with_step(Step::new("trial_ending").with_delay(5, 0).skip_tag("customer"));

    let ids = vec![welcome.id, trial.id];
    store.save(welcome).await?;
    store.save(trial).await?;
    info!(count = ids.len(), "Demo sequences seeded");
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recipients::Recipient;
    use crate::rendering::Renderer;
    use crate::store::InMemorySequenceStore;

    #[tokio::test]
    async fn test_seed_installs_sequences_with_templates() {
        let store = InMemorySequenceStore::new();
        let renderer = TemplateRenderer::new();
        let ids = seed_demo_sequences(&store, &renderer).await.unwrap();
        assert_eq!(ids.len(), 2);

        let signup = store.active_for_trigger(&TriggerType::Signup).await.unwrap();
        assert_eq!(signup.len(), 1);
        assert_eq!(signup[0].slug, "welcome-series");

        let recipient = Recipient::new("r1", "ada@example.com").with_attribute("first_name", "Ada");
        for sequence in store.list().await.unwrap() {
            for step in &sequence.steps {
                assert!(renderer.render(&step.content_ref, &recipient).await.is_ok());
            }
        }
    }
}
