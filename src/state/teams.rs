//! Team partitioning, score totals and turn order. Pure functions over a player set.

use serde::Serialize;

use crate::state::session::{Gender, Player, Team, UserId};

/// Players split by team attribute. Players without a team land in
/// `unassigned` instead of being dropped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Teams {
    /// Members of the men team.
    pub men: Vec<Player>,
    /// Members of the women team.
    pub women: Vec<Player>,
    /// Players without a team.
    pub unassigned: Vec<Player>,
}

impl Teams {
    /// Partition `players` by their current team.
    pub fn partition(players: &[Player]) -> Self {
        let mut teams = Teams::default();
        for player in players {
            match player.team {
                Some(Team::Men) => teams.men.push(player.clone()),
                Some(Team::Women) => teams.women.push(player.clone()),
                None => teams.unassigned.push(player.clone()),
            }
        }
        teams
    }

    /// Members of `team`.
    pub fn members(&self, team: Team) -> &[Player] {
        match team {
            Team::Men => &self.men,
            Team::Women => &self.women,
        }
    }
}

/// Team a player gets from their gender attribute.
pub fn team_for_gender(gender: Gender) -> Option<Team> {
    match gender {
        Gender::Male => Some(Team::Men),
        Gender::Female => Some(Team::Women),
        Gender::Other => None,
    }
}

/// Gender-based assignment for every player, in input order.
pub fn assign_by_gender(players: &[Player]) -> Vec<(UserId, Option<Team>)> {
    players
        .iter()
        .map(|player| (player.user_id, team_for_gender(player.gender())))
        .collect()
}

/// Score and chips summed over a group of players.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Totals {
    /// Sum of scores.
    pub score: u64,
    /// Sum of chips.
    pub chips: u64,
    /// Number of players counted.
    pub players: usize,
}

impl Totals {
    fn add(&mut self, player: &Player) {
        self.score += u64::from(player.score);
        self.chips += u64::from(player.chips);
        self.players += 1;
    }
}

/// Per-team totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TeamTotals {
    /// Men team.
    pub men: Totals,
    /// Women team.
    pub women: Totals,
    /// Players without a team.
    pub unassigned: Totals,
}

impl TeamTotals {
    /// Sum scores and chips per team.
    pub fn from_players(players: &[Player]) -> Self {
        let mut totals = TeamTotals::default();
        for player in players {
            match player.team {
                Some(Team::Men) => totals.men.add(player),
                Some(Team::Women) => totals.women.add(player),
                None => totals.unassigned.add(player),
            }
        }
        totals
    }

    /// Team with the higher score, `None` on a tie.
    pub fn leader(&self) -> Option<Team> {
        match self.men.score.cmp(&self.women.score) {
            std::cmp::Ordering::Greater => Some(Team::Men),
            std::cmp::Ordering::Less => Some(Team::Women),
            std::cmp::Ordering::Equal => None,
        }
    }
}

/// Stable order in which players take turns (hot seat, confessions).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TurnOrder {
    order: Vec<UserId>,
}

impl TurnOrder {
    /// Order players by join time, then user id.
    pub fn from_players(players: &[Player]) -> Self {
        let mut sorted: Vec<&Player> = players.iter().collect();
        sorted.sort_by(|a, b| {
            a.joined_at
                .cmp(&b.joined_at)
                .then_with(|| a.user_id.cmp(&b.user_id))
        });
        Self {
            order: sorted.into_iter().map(|player| player.user_id).collect(),
        }
    }

    /// Player whose turn it is in the 1-based `round`, cycling through the table.
    pub fn player_for_round(&self, round: u32) -> Option<UserId> {
        if self.order.is_empty() || round == 0 {
            return None;
        }
        let index = (round as usize - 1) % self.order.len();
        self.order.get(index).copied()
    }

    /// Whether `index` is the last position.
    pub fn is_last(&self, index: usize) -> bool {
        !self.order.is_empty() && index + 1 == self.order.len()
    }

    /// Position of `user_id` in the order.
    pub fn position(&self, user_id: UserId) -> Option<usize> {
        self.order.iter().position(|id| *id == user_id)
    }

    /// Number of players.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Whether no players are seated.
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, SystemTime};

    use uuid::Uuid;

    use super::*;
    use crate::state::session::{PlayerStatus, Profile};

    fn player(n: u64, gender: Option<Gender>, team: Option<Team>, score: u32) -> Player {
        Player {
            session_id: Uuid::nil(),
            user_id: Uuid::from_u128(u128::from(n)),
            team,
            score,
            chips: 1,
            status: PlayerStatus::Joined,
            joined_at: SystemTime::UNIX_EPOCH + Duration::from_secs(n),
            profile: gender.map(|gender| Profile {
                display_name: format!("p{n}"),
                gender,
                avatar_url: None,
            }),
        }
    }

    #[test]
    fn gender_assignment_is_deterministic() {
        let players = vec![
            player(1, Some(Gender::Male), None, 0),
            player(2, Some(Gender::Female), None, 0),
            player(3, Some(Gender::Male), None, 0),
            player(4, Some(Gender::Female), None, 0),
            player(5, Some(Gender::Male), None, 0),
            player(6, Some(Gender::Other), None, 0),
            player(7, None, None, 0),
        ];

        let first = assign_by_gender(&players);
        assert_eq!(first, assign_by_gender(&players));

        let men: Vec<u128> = first
            .iter()
            .filter(|(_, team)| *team == Some(Team::Men))
            .map(|(id, _)| id.as_u128())
            .collect();
        assert_eq!(men, vec![1, 3, 5]);
        assert_eq!(first[5].1, None);
        assert_eq!(first[6].1, None);
    }

    #[test]
    fn partition_keeps_unassigned_players() {
        let players = vec![
            player(1, None, Some(Team::Men), 0),
            player(2, None, None, 0),
            player(3, None, Some(Team::Women), 0),
        ];
        let teams = Teams::partition(&players);
        assert_eq!(teams.men.len(), 1);
        assert_eq!(teams.women.len(), 1);
        assert_eq!(teams.unassigned.len(), 1);
        assert_eq!(teams.members(Team::Women)[0].user_id, Uuid::from_u128(3));
    }

    #[test]
    fn totals_sum_per_team() {
        let players = vec![
            player(1, None, Some(Team::Men), 4),
            player(2, None, Some(Team::Men), 6),
            player(3, None, Some(Team::Women), 7),
        ];
        let totals = TeamTotals::from_players(&players);
        assert_eq!(totals.men.score, 10);
        assert_eq!(totals.men.chips, 2);
        assert_eq!(totals.women.players, 1);
        assert_eq!(totals.leader(), Some(Team::Men));
    }

    #[test]
    fn turn_order_cycles_by_join_time() {
        let players = vec![player(3, None, None, 0), player(1, None, None, 0)];
        let order = TurnOrder::from_players(&players);
        assert_eq!(order.player_for_round(1), Some(Uuid::from_u128(1)));
        assert_eq!(order.player_for_round(2), Some(Uuid::from_u128(3)));
        assert_eq!(order.player_for_round(3), Some(Uuid::from_u128(1)));
        assert_eq!(order.player_for_round(0), None);
        assert!(order.is_last(1));
        assert!(!order.is_last(0));
    }
}
