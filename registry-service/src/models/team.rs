//! Team model - the authorization scope that owns tokens.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use validator::Validate;

/// Well-known team that always exists and owns route management.
pub const CORE_TEAM_ID: &str = "core-team";

pub const DEFAULT_TEAM_COLOR: &str = "#3b82f6";

/// Creator recorded on teams made by the service itself.
pub const SYSTEM_ACTOR: &str = "system";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Team {
    pub id: String,
    pub name: String,
    pub description: String,
    pub color: String,
    pub icon: String,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

impl Team {
    pub fn new(id: impl Into<String>, name: impl Into<String>, created_by: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            color: DEFAULT_TEAM_COLOR.to_string(),
            icon: String::new(),
            created_by: created_by.into(),
            created_at: Utc::now(),
        }
    }

    pub fn core() -> Self {
        let mut team = Self::new(CORE_TEAM_ID, "Core Team", SYSTEM_ACTOR);
        team.description = "Owns gateway route management".to_string();
        team
    }
}

/// Team ids are non-empty and contain no whitespace.
pub fn validate_team_id(id: &str) -> Result<(), String> {
    if id.is_empty() {
        return Err("Team ID must not be empty".to_string());
    }
    if id.chars().any(char::is_whitespace) {
        return Err(format!("Team ID '{}' must not contain whitespace", id));
    }
    Ok(())
}

/// Request to create a team.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct NewTeam {
    pub id: String,
    #[validate(length(min = 1, max = 255))]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub icon: Option<String>,
}

impl NewTeam {
    pub fn into_team(self, created_by: &str) -> Team {
        let mut team = Team::new(self.id, self.name, created_by);
        team.description = self.description;
        if let Some(color) = self.color.filter(|c| !c.is_empty()) {
            team.color = color;
        }
        if let Some(icon) = self.icon {
            team.icon = icon;
        }
        team
    }
}

/// Partial update of a team's presentation fields.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TeamPatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub color: Option<String>,
    pub icon: Option<String>,
}

impl TeamPatch {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.description.is_none() && self.color.is_none() && self.icon.is_none()
    }

    pub fn apply(&self, team: &mut Team) {
        if let Some(name) = &self.name {
            team.name = name.clone();
        }
        if let Some(description) = &self.description {
            team.description = description.clone();
        }
        if let Some(color) = &self.color {
            team.color = color.clone();
        }
        if let Some(icon) = &self.icon {
            team.icon = icon.clone();
        }
    }
}

/// Team with its current member count, for listings.
#[derive(Debug, Clone, Serialize)]
pub struct TeamSummary {
    #[serde(flatten)]
    pub team: Team,
    pub member_count: usize,
}

/// A principal's membership as reported for a team.
#[derive(Debug, Clone, Serialize)]
pub struct TeamMember {
    pub principal_id: String,
    pub email: Option<String>,
    pub role: super::Role,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn team_id_rules() {
        assert!(validate_team_id("platform-team").is_ok());
        assert!(validate_team_id("").is_err());
        assert!(validate_team_id("platform team").is_err());
        assert!(validate_team_id("tab\tteam").is_err());
    }

    #[test]
    fn patch_only_touches_given_fields() {
        let mut team = Team::new("alpha", "Alpha", "u1");
        let patch = TeamPatch {
            color: Some("#000000".to_string()),
            ..Default::default()
        };
        patch.apply(&mut team);
        assert_eq!(team.name, "Alpha");
        assert_eq!(team.color, "#000000");
        assert!(TeamPatch::default().is_empty());
    }

    #[test]
    fn new_team_falls_back_to_default_color() {
        let req: NewTeam = serde_json::from_str(r#"{"id":"data","name":"Data","color":""}"#).unwrap();
        let team = req.into_team("u1");
        assert_eq!(team.color, DEFAULT_TEAM_COLOR);
        assert_eq!(team.icon, "");
        assert_eq!(team.created_by, "u1");
    }
}
