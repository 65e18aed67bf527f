use std::collections::BTreeMap;

use dashmap::DashMap;
use tracing::info;

use crate::limits::*;
use crate::model::*;

use super::error::{ConflictKind, Entity, StateViolation};
use super::{Engine, EngineError};

/// Read-side lookup of shift templates, their position rules and positions.
pub struct ShiftCatalog {
    templates: DashMap<DbId, ShiftTemplate>,
    rules: DashMap<DbId, Vec<PositionRule>>,
    positions: DashMap<DbId, Position>,
}

impl ShiftCatalog {
    pub fn new() -> Self {
        Self {
            templates: DashMap::new(),
            rules: DashMap::new(),
            positions: DashMap::new(),
        }
    }

    pub fn template(&self, id: DbId) -> Option<ShiftTemplate> {
        self.templates.get(&id).map(|e| e.value().clone())
    }

    pub fn window(&self, id: DbId) -> Option<TimeWindow> {
        self.templates.get(&id).map(|e| e.window)
    }

    /// Templates ordered by start time, then id.
    pub fn templates(&self) -> Vec<ShiftTemplate> {
        let mut all: Vec<ShiftTemplate> = self.templates.iter().map(|e| e.value().clone()).collect();
        all.sort_by_key(|t| (t.window.start, t.id));
        all
    }

    pub fn template_count(&self) -> usize {
        self.templates.len()
    }

    pub fn rules(&self, shift_id: DbId) -> Vec<PositionRule> {
        self.rules
            .get(&shift_id)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    /// Sum of the required counts of allowed positions.
    pub fn total_required(&self, shift_id: DbId) -> u32 {
        self.rules
            .get(&shift_id)
            .map(|rules| {
                rules
                    .iter()
                    .filter(|r| r.allowed)
                    .filter_map(|r| r.required_count)
                    .sum()
            })
            .unwrap_or(0)
    }

    pub fn position(&self, id: DbId) -> Option<Position> {
        self.positions.get(&id).map(|e| e.value().clone())
    }

    pub fn positions(&self) -> Vec<Position> {
        let mut all: Vec<Position> = self.positions.iter().map(|e| e.value().clone()).collect();
        all.sort_by_key(|p| p.id);
        all
    }

    pub(super) fn all_rules(&self) -> Vec<(DbId, Vec<PositionRule>)> {
        let mut all: Vec<_> = self
            .rules
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        all.sort_by_key(|(id, _)| *id);
        all
    }

    pub(super) fn save_template(&self, template: ShiftTemplate) {
        self.templates.insert(template.id, template);
    }

    pub(super) fn replace_rules(&self, shift_id: DbId, rules: Vec<PositionRule>) {
        self.rules.insert(shift_id, rules);
    }

    pub(super) fn save_position(&self, position: Position) {
        self.positions.insert(position.id, position);
    }
}

/// Users known to this store: employees and admins.
pub struct EmployeeDirectory {
    users: DashMap<DbId, User>,
}

impl EmployeeDirectory {
    pub fn new() -> Self {
        Self {
            users: DashMap::new(),
        }
    }

    pub fn user(&self, id: DbId) -> Option<User> {
        self.users.get(&id).map(|e| e.value().clone())
    }

    pub fn position_of(&self, id: DbId) -> Option<DbId> {
        self.users.get(&id).and_then(|e| e.position_id)
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn users(&self) -> Vec<User> {
        let mut all: Vec<User> = self.users.iter().map(|e| e.value().clone()).collect();
        all.sort_by_key(|u| u.id);
        all
    }

    pub(super) fn save(&self, user: User) {
        self.users.insert(user.id, user);
    }
}

fn check_shift_name(name: &str) -> Result<(), EngineError> {
    if name.trim().is_empty() {
        return Err(EngineError::LimitExceeded("shift name must not be empty"));
    }
    if name.chars().count() > MAX_SHIFT_NAME_LEN {
        return Err(EngineError::LimitExceeded("shift name too long"));
    }
    Ok(())
}

fn check_description(description: &Option<String>) -> Result<(), EngineError> {
    if let Some(d) = description
        && d.len() > MAX_DESCRIPTION_LEN
    {
        return Err(EngineError::LimitExceeded("description too long"));
    }
    Ok(())
}

impl Engine {
    pub async fn create_position(&self, id: DbId, name: String) -> Result<Position, EngineError> {
        let _gate = self.gate.write().await;
        if name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("position name too long"));
        }
        if self.catalog.position(id).is_some() {
            return Err(EngineError::AlreadyExists(Entity::Position(id)));
        }
        let position = Position { id, name };
        self.commit(
            &mut [],
            None,
            vec![Event::PositionSaved {
                position: position.clone(),
            }],
        )
        .await?;
        Ok(position)
    }

    /// Insert or replace a user of the directory.
    pub async fn save_user(&self, user: User) -> Result<(), EngineError> {
        let _gate = self.gate.write().await;
        if user.full_name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("user name too long"));
        }
        if self.directory.user(user.id).is_none() && self.directory.len() >= MAX_USERS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many users"));
        }
        if let Some(position_id) = user.position_id
            && self.catalog.position(position_id).is_none()
        {
            return Err(EngineError::NotFound(Entity::Position(position_id)));
        }
        self.commit(&mut [], None, vec![Event::UserSaved { user }])
            .await
    }

    pub async fn create_template(
        &self,
        new: NewTemplate,
        rules: Option<Vec<RuleInput>>,
        admin_id: Option<DbId>,
    ) -> Result<ShiftTemplate, EngineError> {
        let _gate = self.gate.write().await;
        check_shift_name(&new.name)?;
        check_description(&new.description)?;
        if !new.window.is_valid() {
            return Err(StateViolation::InvalidTimeWindow.into());
        }
        if self.catalog.template(new.id).is_some() {
            return Err(EngineError::AlreadyExists(Entity::Shift(new.id)));
        }
        if self.catalog.template_count() >= MAX_TEMPLATES_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many shift templates"));
        }

        let actor = self.attribute(admin_id);
        let template = ShiftTemplate {
            id: new.id,
            name: new.name,
            window: new.window,
            active: new.active,
            description: new.description,
            created_by: actor,
            created_at: self.clock.now(),
            updated_by: None,
            updated_at: None,
        };
        let mut events = vec![Event::TemplateSaved {
            template: template.clone(),
        }];
        if let Some(rules) = rules {
            let rules = self.normalize_rules(template.id, rules)?;
            events.push(Event::RulesReplaced {
                shift_id: template.id,
                rules,
            });
        }
        self.commit(&mut [], actor, events).await?;
        info!(shift_id = template.id, name = %template.name, "shift template created");
        Ok(template)
    }

    /// Partial update. Name and time window are frozen once the template has
    /// occurrences; turning `active` off reconciles its occurrences in the
    /// same commit.
    pub async fn update_template(
        &self,
        id: DbId,
        patch: TemplatePatch,
        admin_id: Option<DbId>,
    ) -> Result<(ShiftTemplate, Option<DeactivationCounts>), EngineError> {
        let _gate = self.gate.write().await;
        let current = self
            .catalog
            .template(id)
            .ok_or(EngineError::NotFound(Entity::Shift(id)))?;

        let mut next = current.clone();
        if let Some(name) = patch.name.clone() {
            check_shift_name(&name)?;
            next.name = name;
        }
        if let Some(start) = patch.start {
            next.window.start = start;
        }
        if let Some(end) = patch.end {
            next.window.end = end;
        }
        if patch.description.is_some() {
            check_description(&patch.description)?;
            next.description = patch.description.clone();
        }
        if let Some(active) = patch.active {
            next.active = active;
        }
        if !next.window.is_valid() {
            return Err(StateViolation::InvalidTimeWindow.into());
        }
        let identity_changed = next.name != current.name || next.window != current.window;
        if identity_changed && self.shift_has_occurrences(id).await {
            return Err(ConflictKind::TemplateInUse(id).into());
        }

        let actor = self.attribute(admin_id);
        let now = self.clock.now();
        next.updated_by = actor;
        next.updated_at = Some(now);
        let saved = Event::TemplateSaved {
            template: next.clone(),
        };

        let counts = if current.active && !next.active {
            Some(self.reconcile_deactivated(&next, actor, vec![saved]).await?)
        } else {
            self.commit(&mut [], actor, vec![saved])
                .await?;
            None
        };
        info!(shift_id = id, active = next.active, "shift template updated");
        Ok((next, counts))
    }

    pub async fn set_template_active(
        &self,
        id: DbId,
        active: bool,
        admin_id: Option<DbId>,
    ) -> Result<Option<DeactivationCounts>, EngineError> {
        let patch = TemplatePatch {
            active: Some(active),
            ..TemplatePatch::default()
        };
        self.update_template(id, patch, admin_id)
            .await
            .map(|(_, counts)| counts)
    }

    /// Replace the position rules of a template.
    pub async fn set_position_rules(
        &self,
        shift_id: DbId,
        rules: Vec<RuleInput>,
        admin_id: Option<DbId>,
    ) -> Result<Vec<PositionRule>, EngineError> {
        let _gate = self.gate.write().await;
        if self.catalog.template(shift_id).is_none() {
            return Err(EngineError::NotFound(Entity::Shift(shift_id)));
        }
        let rules = self.normalize_rules(shift_id, rules)?;
        let actor = self.attribute(admin_id);
        self.commit(
            &mut [],
            actor,
            vec![Event::RulesReplaced {
                shift_id,
                rules: rules.clone(),
            }],
        )
        .await?;
        info!(shift_id, rules = rules.len(), "position rules replaced");
        Ok(rules)
    }

    /// Dedupe by position (last entry wins), resolve `allowed`, and require at
    /// least one staffed slot in total.
    fn normalize_rules(
        &self,
        shift_id: DbId,
        inputs: Vec<RuleInput>,
    ) -> Result<Vec<PositionRule>, EngineError> {
        let mut by_position: BTreeMap<DbId, PositionRule> = BTreeMap::new();
        for input in inputs {
            if self.catalog.position(input.position_id).is_none() {
                return Err(EngineError::NotFound(Entity::Position(input.position_id)));
            }
            let allowed = input.allowed.unwrap_or(input.required_count != Some(0));
            by_position.insert(
                input.position_id,
                PositionRule {
                    shift_id,
                    position_id: input.position_id,
                    allowed,
                    required_count: input.required_count,
                },
            );
        }
        if by_position.len() > MAX_RULES_PER_SHIFT {
            return Err(EngineError::LimitExceeded("too many position rules"));
        }
        let total: u32 = by_position
            .values()
            .filter(|r| r.allowed)
            .filter_map(|r| r.required_count)
            .sum();
        if total == 0 {
            return Err(StateViolation::NoRequiredSlots(shift_id).into());
        }
        Ok(by_position.into_values().collect())
    }
}
