use chrono::{DateTime, Datelike, Days, NaiveDate, NaiveTime, Utc, Weekday};
use chrono_tz::Tz;
use rrule::RRuleSet;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

use crate::error::CoreError;
use crate::timezone::{parse_timezone, resolve_local};

/// Default bound for constrained searches, roughly two years.
pub const DEFAULT_LOOKAHEAD_DAYS: u32 = 731;

/// Fixed-interval rules never need more than a handful of steps past the estimate.
const FIXED_SEARCH_STEPS: u64 = 8;

// ============================================================================
// Rule model
// ============================================================================

/// Unit a recurrence interval is measured in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Frequency {
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

impl Frequency {
    fn as_rrule(&self) -> &'static str {
        match self {
            Frequency::Daily => "DAILY",
            Frequency::Weekly => "WEEKLY",
            Frequency::Monthly => "MONTHLY",
            Frequency::Yearly => "YEARLY",
        }
    }
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Frequency::Daily => write!(f, "daily"),
            Frequency::Weekly => write!(f, "weekly"),
            Frequency::Monthly => write!(f, "monthly"),
            Frequency::Yearly => write!(f, "yearly"),
        }
    }
}

#[derive(Error, Debug, PartialEq)]
#[error("Invalid frequency: {0}")]
pub struct ParseFrequencyError(String);

impl FromStr for Frequency {
    type Err = ParseFrequencyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "daily" | "day" | "days" => Ok(Frequency::Daily),
            "weekly" | "week" | "weeks" => Ok(Frequency::Weekly),
            "monthly" | "month" | "months" => Ok(Frequency::Monthly),
            "yearly" | "year" | "years" | "annually" => Ok(Frequency::Yearly),
            _ => Err(ParseFrequencyError(s.to_string())),
        }
    }
}

/// Restricts which days inside an active period produce an occurrence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DayConstraint {
    /// Any of the listed weekdays
    Weekdays { days: Vec<Weekday> },
    /// Days of month; negative values count back from the month end (-1 = last day)
    MonthDays { days: Vec<i8> },
    /// The n-th given weekday of the month; negative n counts from the end
    NthWeekday { n: i8, weekday: Weekday },
    /// Last Monday-to-Friday day of the month
    LastBusinessDay,
    /// Predicate registered on the evaluator under this name
    Custom { name: String },
}

impl fmt::Display for DayConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DayConstraint::Weekdays { days } => {
                let names: Vec<String> = days.iter().map(|d| d.to_string()).collect();
                write!(f, "on {}", names.join(","))
            }
            DayConstraint::MonthDays { days } => {
                let values: Vec<String> = days.iter().map(|d| d.to_string()).collect();
                write!(f, "on month day {}", values.join(","))
            }
            DayConstraint::NthWeekday { n, weekday } => write!(f, "on {} {}", ordinal_label(*n), weekday),
            DayConstraint::LastBusinessDay => write!(f, "on the last business day"),
            DayConstraint::Custom { name } => write!(f, "matching '{}'", name),
        }
    }
}

fn ordinal_label(n: i8) -> String {
    match n {
        -1 => "last".to_string(),
        1 => "1st".to_string(),
        2 => "2nd".to_string(),
        3 => "3rd".to_string(),
        n if n < 0 => format!("{}th from last", -n),
        n => format!("{}th", n),
    }
}

/// Semantic description of a repeating schedule.
///
/// The `anchor` fixes both the phase of the interval and the local
/// time-of-day every occurrence is stamped with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecurrenceRule {
    pub frequency: Frequency,
    pub interval: u32,
    pub anchor: DateTime<Utc>,
    /// IANA timezone name the anchor's wall-clock time is kept in
    pub timezone: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constraint: Option<DayConstraint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_occurrences: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<DateTime<Utc>>,
}

impl RecurrenceRule {
    pub fn new(frequency: Frequency, anchor: DateTime<Utc>, timezone: impl Into<String>) -> Self {
        Self {
            frequency,
            interval: 1,
            anchor,
            timezone: timezone.into(),
            constraint: None,
            max_occurrences: None,
            end_date: None,
        }
    }

    pub fn daily(anchor: DateTime<Utc>, timezone: impl Into<String>) -> Self {
        Self::new(Frequency::Daily, anchor, timezone)
    }

    pub fn weekly(anchor: DateTime<Utc>, timezone: impl Into<String>) -> Self {
        Self::new(Frequency::Weekly, anchor, timezone)
    }

    pub fn monthly(anchor: DateTime<Utc>, timezone: impl Into<String>) -> Self {
        Self::new(Frequency::Monthly, anchor, timezone)
    }

    pub fn every(mut self, interval: u32) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_constraint(mut self, constraint: DayConstraint) -> Self {
        self.constraint = Some(constraint);
        self
    }

    pub fn limit(mut self, max_occurrences: u32) -> Self {
        self.max_occurrences = Some(max_occurrences);
        self
    }

    pub fn until(mut self, end_date: DateTime<Utc>) -> Self {
        self.end_date = Some(end_date);
        self
    }

    /// RFC 5545 RRULE body for calendar providers.
    ///
    /// Returns `None` for custom predicates, which have no RRULE equivalent.
    pub fn to_rrule(&self) -> Option<String> {
        let mut parts = vec![
            format!("FREQ={}", self.frequency.as_rrule()),
            format!("INTERVAL={}", self.interval),
        ];

        match &self.constraint {
            None => {}
            Some(DayConstraint::Weekdays { days }) => {
                let codes: Vec<&str> = days.iter().map(weekday_code).collect();
                parts.push(format!("BYDAY={}", codes.join(",")));
            }
            Some(DayConstraint::MonthDays { days }) => {
                let values: Vec<String> = days.iter().map(|d| d.to_string()).collect();
                parts.push(format!("BYMONTHDAY={}", values.join(",")));
            }
            Some(DayConstraint::NthWeekday { n, weekday }) => {
                parts.push(format!("BYDAY={}{}", n, weekday_code(weekday)));
            }
            Some(DayConstraint::LastBusinessDay) => {
                parts.push("BYDAY=MO,TU,WE,TH,FR".to_string());
                parts.push("BYSETPOS=-1".to_string());
            }
            Some(DayConstraint::Custom { .. }) => return None,
        }

        if let Some(count) = self.max_occurrences {
            parts.push(format!("COUNT={}", count));
        }
        if let Some(end_date) = self.end_date {
            parts.push(format!("UNTIL={}", end_date.format("%Y%m%dT%H%M%SZ")));
        }

        Some(parts.join(";"))
    }
}

impl fmt::Display for RecurrenceRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.interval == 1 {
            write!(f, "{}", self.frequency)?;
        } else {
            write!(f, "every {} {}", self.interval, unit_name(self.frequency))?;
        }
        if let Some(constraint) = &self.constraint {
            write!(f, " {}", constraint)?;
        }
        if let Some(count) = self.max_occurrences {
            write!(f, ", {} times", count)?;
        }
        if let Some(end_date) = self.end_date {
            write!(f, ", until {}", end_date.format("%Y-%m-%d"))?;
        }
        Ok(())
    }
}

fn unit_name(frequency: Frequency) -> &'static str {
    match frequency {
        Frequency::Daily => "days",
        Frequency::Weekly => "weeks",
        Frequency::Monthly => "months",
        Frequency::Yearly => "years",
    }
}

fn weekday_code(weekday: &Weekday) -> &'static str {
    match weekday {
        Weekday::Mon => "MO",
        Weekday::Tue => "TU",
        Weekday::Wed => "WE",
        Weekday::Thu => "TH",
        Weekday::Fri => "FR",
        Weekday::Sat => "SA",
        Weekday::Sun => "SU",
    }
}

// ============================================================================
// Day predicates
// ============================================================================

/// A pluggable day filter for rules the built-in constraints cannot express.
pub trait DayPredicate: Send + Sync {
    fn matches(&self, date: NaiveDate) -> bool;
}

impl<F> DayPredicate for F
where
    F: Fn(NaiveDate) -> bool + Send + Sync,
{
    fn matches(&self, date: NaiveDate) -> bool {
        self(date)
    }
}

pub fn days_in_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .and_then(|first| first.pred_opt())
        .map(|last| last.day())
        .unwrap_or(28)
}

fn is_business_day(date: NaiveDate) -> bool {
    !matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
}

pub fn is_last_business_day(date: NaiveDate) -> bool {
    if !is_business_day(date) {
        return false;
    }
    let mut probe = date;
    while let Some(next) = probe.succ_opt() {
        if next.month() != date.month() {
            return true;
        }
        if is_business_day(next) {
            return false;
        }
        probe = next;
    }
    true
}

fn matches_month_day(date: NaiveDate, day: i8) -> bool {
    let dim = days_in_month(date.year(), date.month()) as i32;
    let target = if day > 0 { day as i32 } else { dim + day as i32 + 1 };
    date.day() as i32 == target
}

fn matches_nth_weekday(date: NaiveDate, n: i8, weekday: Weekday) -> bool {
    if date.weekday() != weekday {
        return false;
    }
    if n > 0 {
        ((date.day() - 1) / 7 + 1) as i8 == n
    } else {
        let dim = days_in_month(date.year(), date.month());
        ((dim - date.day()) / 7 + 1) as i8 == -n
    }
}

// ============================================================================
// ScheduleEvaluator
// ============================================================================

/// Computes occurrence instants for recurrence rules.
///
/// Pure and deterministic: the same `(rule, instant)` always produces the same
/// answer, which is what lets generation be replayed after a crash.
pub struct ScheduleEvaluator {
    lookahead_days: u32,
    predicates: HashMap<String, Arc<dyn DayPredicate>>,
}

impl fmt::Debug for ScheduleEvaluator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.predicates.keys().collect();
        names.sort();
        f.debug_struct("ScheduleEvaluator")
            .field("lookahead_days", &self.lookahead_days)
            .field("predicates", &names)
            .finish()
    }
}

impl Default for ScheduleEvaluator {
    fn default() -> Self {
        Self::new(DEFAULT_LOOKAHEAD_DAYS)
    }
}

/// A rule resolved into local terms once per evaluation.
struct Schedule<'a> {
    rule: &'a RecurrenceRule,
    tz: Tz,
    anchor_date: NaiveDate,
    time_of_day: NaiveTime,
}

impl<'a> Schedule<'a> {
    fn new(rule: &'a RecurrenceRule) -> Result<Self, CoreError> {
        if rule.interval == 0 {
            return Err(CoreError::InvalidRule("interval must be at least 1".to_string()));
        }
        let tz = parse_timezone(&rule.timezone)
            .map_err(|_| CoreError::InvalidRule(format!("unknown timezone '{}'", rule.timezone)))?;
        let local_anchor = rule.anchor.with_timezone(&tz);
        Ok(Self {
            rule,
            tz,
            anchor_date: local_anchor.date_naive(),
            time_of_day: local_anchor.time(),
        })
    }

    fn instant_on(&self, date: NaiveDate) -> DateTime<Utc> {
        resolve_local(&self.tz, date, self.time_of_day)
    }

    fn local_date(&self, instant: DateTime<Utc>) -> NaiveDate {
        instant.with_timezone(&self.tz).date_naive()
    }

    /// Whole frequency units from the anchor's period to the period holding `date`.
    fn units_since_anchor(&self, date: NaiveDate) -> i64 {
        match self.rule.frequency {
            Frequency::Daily => (date - self.anchor_date).num_days(),
            Frequency::Weekly => (week_start(date) - week_start(self.anchor_date)).num_days() / 7,
            Frequency::Monthly => months_between(self.anchor_date, date),
            Frequency::Yearly => (date.year() - self.anchor_date.year()) as i64,
        }
    }

    fn in_active_period(&self, date: NaiveDate) -> bool {
        date >= self.anchor_date && self.units_since_anchor(date) % self.rule.interval as i64 == 0
    }

    /// First day of the earliest active period beginning after `date`.
    fn next_active_period_start(&self, date: NaiveDate) -> Option<NaiveDate> {
        let interval = self.rule.interval as i64;
        let units = self.units_since_anchor(date).max(0);
        let k = u64::try_from((units / interval + 1) * interval).ok()?;
        let start = match self.rule.frequency {
            Frequency::Daily => self.anchor_date.checked_add_days(Days::new(k))?,
            Frequency::Weekly => week_start(self.anchor_date).checked_add_days(Days::new(k.checked_mul(7)?))?,
            Frequency::Monthly => shift_months(self.anchor_date.with_day(1)?, k)?,
            Frequency::Yearly => {
                let year = self.anchor_date.year().checked_add(i32::try_from(k).ok()?)?;
                NaiveDate::from_ymd_opt(year, 1, 1)?
            }
        };
        Some(start.max(self.anchor_date))
    }

    /// `date` itself when it lies in an active period, else the next period's first day.
    fn active_from(&self, date: NaiveDate) -> Option<NaiveDate> {
        if self.in_active_period(date) {
            Some(date)
        } else {
            self.next_active_period_start(date).filter(|start| *start > date)
        }
    }

    /// Date of the k-th (0-based) fixed-interval occurrence.
    fn fixed_date(&self, k: u64) -> Option<NaiveDate> {
        let steps = k.checked_mul(self.rule.interval as u64)?;
        match self.rule.frequency {
            Frequency::Daily => self.anchor_date.checked_add_days(Days::new(steps)),
            Frequency::Weekly => self.anchor_date.checked_add_days(Days::new(steps.checked_mul(7)?)),
            Frequency::Monthly => shift_months(self.anchor_date, steps),
            Frequency::Yearly => shift_months(self.anchor_date, steps.checked_mul(12)?),
        }
    }

    /// Index of the first fixed occurrence that can possibly reach `date`.
    fn estimate_index(&self, date: NaiveDate) -> u64 {
        let units = match self.rule.frequency {
            Frequency::Weekly => (date - self.anchor_date).num_days() / 7,
            _ => self.units_since_anchor(date),
        };
        if units <= 0 {
            return 0;
        }
        ((units as u64) / self.rule.interval as u64).saturating_sub(1)
    }
}

fn week_start(date: NaiveDate) -> NaiveDate {
    date - chrono::Duration::days(date.weekday().num_days_from_monday() as i64)
}

fn months_between(from: NaiveDate, to: NaiveDate) -> i64 {
    (to.year() as i64 - from.year() as i64) * 12 + (to.month0() as i64 - from.month0() as i64)
}

/// Shift by whole months, clamping the day to the target month's length.
fn shift_months(date: NaiveDate, months: u64) -> Option<NaiveDate> {
    let total = (date.year() as i64) * 12 + date.month0() as i64 + i64::try_from(months).ok()?;
    let year = i32::try_from(total.div_euclid(12)).ok()?;
    let month = total.rem_euclid(12) as u32 + 1;
    let day = date.day().min(days_in_month(year, month));
    NaiveDate::from_ymd_opt(year, month, day)
}

#[derive(Clone, Copy)]
enum Bound {
    AtOrAfter(DateTime<Utc>),
    After(DateTime<Utc>),
}

impl Bound {
    fn instant(&self) -> DateTime<Utc> {
        match self {
            Bound::AtOrAfter(t) | Bound::After(t) => *t,
        }
    }

    fn admits(&self, candidate: DateTime<Utc>) -> bool {
        match self {
            Bound::AtOrAfter(t) => candidate >= *t,
            Bound::After(t) => candidate > *t,
        }
    }
}

impl ScheduleEvaluator {
    pub fn new(lookahead_days: u32) -> Self {
        Self {
            lookahead_days: lookahead_days.max(1),
            predicates: HashMap::new(),
        }
    }

    /// Registers a named predicate usable through `DayConstraint::Custom`.
    pub fn register_predicate(&mut self, name: impl Into<String>, predicate: impl DayPredicate + 'static) {
        self.predicates.insert(name.into(), Arc::new(predicate));
    }

    pub fn with_predicate(mut self, name: impl Into<String>, predicate: impl DayPredicate + 'static) -> Self {
        self.register_predicate(name, predicate);
        self
    }

    pub fn lookahead_days(&self) -> u32 {
        self.lookahead_days
    }

    /// Rejects malformed rules before they are stored.
    pub fn validate(&self, rule: &RecurrenceRule) -> Result<(), CoreError> {
        Schedule::new(rule)?;

        if rule.max_occurrences == Some(0) {
            return Err(CoreError::InvalidRule("max_occurrences must be at least 1".to_string()));
        }
        if rule.max_occurrences.is_some() && rule.end_date.is_some() {
            return Err(CoreError::InvalidRule(
                "a rule ends either after a count or at an end date, not both".to_string(),
            ));
        }
        if let Some(end_date) = rule.end_date {
            if end_date < rule.anchor {
                return Err(CoreError::InvalidRule("end date is before the rule's start".to_string()));
            }
        }

        if let Some(constraint) = &rule.constraint {
            self.validate_constraint(rule.frequency, constraint)?;
        }

        if let Some(body) = rule.to_rrule() {
            let text = format!("DTSTART:{}\nRRULE:{}", rule.anchor.format("%Y%m%dT%H%M%SZ"), body);
            text.parse::<RRuleSet>()
                .map_err(|e| CoreError::InvalidRule(format!("'{}' is not a valid RRULE: {}", body, e)))?;
        }

        match self.first_run(rule, rule.anchor)? {
            Some(_) => Ok(()),
            None => Err(CoreError::InvalidRule("rule never produces an occurrence".to_string())),
        }
    }

    fn validate_constraint(&self, frequency: Frequency, constraint: &DayConstraint) -> Result<(), CoreError> {
        let monthly_only = |what: &str| {
            if matches!(frequency, Frequency::Monthly | Frequency::Yearly) {
                Ok(())
            } else {
                Err(CoreError::InvalidRule(format!("{} requires a monthly or yearly frequency", what)))
            }
        };

        match constraint {
            DayConstraint::Weekdays { days } => {
                if days.is_empty() {
                    return Err(CoreError::InvalidRule("weekday constraint lists no days".to_string()));
                }
                Ok(())
            }
            DayConstraint::MonthDays { days } => {
                if days.is_empty() {
                    return Err(CoreError::InvalidRule("month-day constraint lists no days".to_string()));
                }
                if let Some(bad) = days.iter().find(|d| **d == 0 || d.abs() > 31) {
                    return Err(CoreError::InvalidRule(format!("month day {} is out of range", bad)));
                }
                monthly_only("a month-day constraint")
            }
            DayConstraint::NthWeekday { n, .. } => {
                if *n == 0 || n.abs() > 5 {
                    return Err(CoreError::InvalidRule(format!("weekday ordinal {} is out of range", n)));
                }
                if frequency != Frequency::Monthly {
                    return Err(CoreError::InvalidRule("an n-th weekday constraint requires a monthly frequency".to_string()));
                }
                Ok(())
            }
            DayConstraint::LastBusinessDay => {
                if frequency != Frequency::Monthly {
                    return Err(CoreError::InvalidRule("last business day requires a monthly frequency".to_string()));
                }
                Ok(())
            }
            DayConstraint::Custom { name } => {
                if !self.predicates.contains_key(name) {
                    return Err(CoreError::InvalidRule(format!("no day predicate registered as '{}'", name)));
                }
                Ok(())
            }
        }
    }

    /// Earliest occurrence at or after `from`. Used to seed a new template.
    pub fn first_run(&self, rule: &RecurrenceRule, from: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, CoreError> {
        self.next_occurrence(rule, Bound::AtOrAfter(from))
    }

    /// Earliest occurrence strictly after `after`, or `None` once the rule has ended.
    pub fn compute_next_run(&self, rule: &RecurrenceRule, after: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, CoreError> {
        self.next_occurrence(rule, Bound::After(after))
    }

    /// Up to `count` upcoming occurrences starting at `from` (inclusive).
    pub fn preview(&self, rule: &RecurrenceRule, from: DateTime<Utc>, count: usize) -> Result<Vec<DateTime<Utc>>, CoreError> {
        let mut occurrences = Vec::with_capacity(count.min(64));
        let mut next = self.first_run(rule, from)?;
        while let Some(instant) = next {
            if occurrences.len() >= count {
                break;
            }
            occurrences.push(instant);
            next = self.compute_next_run(rule, instant)?;
        }
        Ok(occurrences)
    }

    fn next_occurrence(&self, rule: &RecurrenceRule, bound: Bound) -> Result<Option<DateTime<Utc>>, CoreError> {
        let schedule = Schedule::new(rule)?;

        let (candidate, ordinal) = match &rule.constraint {
            None => match self.next_fixed(&schedule, bound)? {
                Some(found) => found,
                None => return Ok(None),
            },
            Some(constraint) => match self.next_constrained(&schedule, constraint, bound)? {
                Some(instant) => {
                    let ordinal = match rule.max_occurrences {
                        Some(max) => self.count_constrained(&schedule, constraint, instant, max)?,
                        None => 0,
                    };
                    (instant, ordinal)
                }
                None => return Ok(None),
            },
        };

        if let Some(end_date) = rule.end_date {
            if candidate > end_date {
                return Ok(None);
            }
        }
        if let Some(max) = rule.max_occurrences {
            if ordinal > max {
                return Ok(None);
            }
        }

        Ok(Some(candidate))
    }

    fn next_fixed(&self, schedule: &Schedule<'_>, bound: Bound) -> Result<Option<(DateTime<Utc>, u32)>, CoreError> {
        let start = schedule.estimate_index(schedule.local_date(bound.instant()));

        for k in start..start + FIXED_SEARCH_STEPS {
            let Some(date) = schedule.fixed_date(k) else {
                return Ok(None);
            };
            let instant = schedule.instant_on(date);
            if bound.admits(instant) {
                return Ok(Some((instant, u32::try_from(k + 1).unwrap_or(u32::MAX))));
            }
        }

        Err(CoreError::InvalidRule(format!(
            "could not place a fixed occurrence after {}",
            bound.instant()
        )))
    }

    fn matches(&self, constraint: &DayConstraint, date: NaiveDate) -> Result<bool, CoreError> {
        let matched = match constraint {
            DayConstraint::Weekdays { days } => days.contains(&date.weekday()),
            DayConstraint::MonthDays { days } => days.iter().any(|d| matches_month_day(date, *d)),
            DayConstraint::NthWeekday { n, weekday } => matches_nth_weekday(date, *n, *weekday),
            DayConstraint::LastBusinessDay => is_last_business_day(date),
            DayConstraint::Custom { name } => self
                .predicates
                .get(name)
                .ok_or_else(|| CoreError::InvalidRule(format!("no day predicate registered as '{}'", name)))?
                .matches(date),
        };
        Ok(matched)
    }

    fn next_constrained(
        &self,
        schedule: &Schedule<'_>,
        constraint: &DayConstraint,
        bound: Bound,
    ) -> Result<Option<DateTime<Utc>>, CoreError> {
        let end_date = schedule.rule.end_date.map(|end| schedule.local_date(end));
        let mut date = schedule.anchor_date.max(schedule.local_date(bound.instant()));

        // Only days inside active periods count toward the lookahead.
        for _ in 0..=self.lookahead_days {
            date = match schedule.active_from(date) {
                Some(active) => active,
                None => return Ok(None),
            };
            if end_date.is_some_and(|end| date > end) {
                return Ok(None);
            }
            if self.matches(constraint, date)? {
                let instant = schedule.instant_on(date);
                if bound.admits(instant) {
                    return Ok(Some(instant));
                }
            }
            date = match date.succ_opt() {
                Some(next) => next,
                None => return Ok(None),
            };
        }

        Err(CoreError::InvalidRule(format!(
            "no occurrence within {} scheduled days after {}",
            self.lookahead_days,
            bound.instant()
        )))
    }

    /// 1-based ordinal of `instant` among the rule's occurrences, capped at `cap + 1`.
    fn count_constrained(
        &self,
        schedule: &Schedule<'_>,
        constraint: &DayConstraint,
        instant: DateTime<Utc>,
        cap: u32,
    ) -> Result<u32, CoreError> {
        let through = schedule.local_date(instant);
        let mut date = schedule.anchor_date;
        let mut count = 0u32;

        loop {
            date = match schedule.active_from(date) {
                Some(active) if active <= through => active,
                _ => break,
            };
            if self.matches(constraint, date)? {
                count += 1;
                if count > cap {
                    break;
                }
            }
            date = match date.succ_opt() {
                Some(next) => next,
                None => break,
            };
        }

        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Timelike};
    use proptest::prelude::*;
    use rstest::rstest;

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    mod fixed_interval_tests {
        use super::*;

        #[test]
        fn test_weekly_monday_scenario() {
            // Monday 2025-01-06 09:00, template created the same morning at 08:00
            let evaluator = ScheduleEvaluator::default();
            let rule = RecurrenceRule::weekly(utc(2025, 1, 6, 9, 0), "UTC");

            let first = evaluator.first_run(&rule, utc(2025, 1, 6, 8, 0)).unwrap();
            assert_eq!(first, Some(utc(2025, 1, 6, 9, 0)));

            let next = evaluator.compute_next_run(&rule, utc(2025, 1, 6, 9, 0)).unwrap();
            assert_eq!(next, Some(utc(2025, 1, 13, 9, 0)));
        }

        #[rstest]
        #[case(Frequency::Daily, 3, utc(2025, 1, 4, 9, 0))]
        #[case(Frequency::Weekly, 2, utc(2025, 1, 15, 9, 0))]
        #[case(Frequency::Monthly, 1, utc(2025, 2, 1, 9, 0))]
        #[case(Frequency::Yearly, 1, utc(2026, 1, 1, 9, 0))]
        fn test_next_run_from_anchor(#[case] frequency: Frequency, #[case] interval: u32, #[case] expected: DateTime<Utc>) {
            let evaluator = ScheduleEvaluator::default();
            let rule = RecurrenceRule::new(frequency, utc(2025, 1, 1, 9, 0), "UTC").every(interval);

            assert_eq!(evaluator.compute_next_run(&rule, rule.anchor).unwrap(), Some(expected));
        }

        #[test]
        fn test_off_grid_reference_snaps_to_anchor_time() {
            let evaluator = ScheduleEvaluator::default();
            let rule = RecurrenceRule::daily(utc(2025, 1, 1, 9, 0), "UTC").every(3);

            // Between the 2025-01-04 and 2025-01-07 occurrences
            let next = evaluator.compute_next_run(&rule, utc(2025, 1, 5, 14, 30)).unwrap();
            assert_eq!(next, Some(utc(2025, 1, 7, 9, 0)));
        }

        #[test]
        fn test_monthly_clamps_to_short_months() {
            let evaluator = ScheduleEvaluator::default();
            let rule = RecurrenceRule::monthly(utc(2025, 1, 31, 12, 0), "UTC");

            let occurrences = evaluator.preview(&rule, rule.anchor, 3).unwrap();
            assert_eq!(
                occurrences,
                vec![utc(2025, 1, 31, 12, 0), utc(2025, 2, 28, 12, 0), utc(2025, 3, 31, 12, 0)]
            );
        }

        #[test]
        fn test_local_time_survives_dst() {
            let evaluator = ScheduleEvaluator::default();
            // 09:00 in New York is 14:00 UTC before the March 9th 2025 switch
            let rule = RecurrenceRule::daily(utc(2025, 3, 7, 14, 0), "America/New_York");
            let tz: Tz = "America/New_York".parse().unwrap();

            for occurrence in evaluator.preview(&rule, rule.anchor, 5).unwrap() {
                assert_eq!(occurrence.with_timezone(&tz).hour(), 9);
            }
        }

        #[test]
        fn test_max_occurrences_ends_after_third() {
            let evaluator = ScheduleEvaluator::default();
            let rule = RecurrenceRule::daily(utc(2025, 1, 1, 9, 0), "UTC").limit(3);

            let first = evaluator.first_run(&rule, rule.anchor).unwrap().unwrap();
            let second = evaluator.compute_next_run(&rule, first).unwrap().unwrap();
            let third = evaluator.compute_next_run(&rule, second).unwrap().unwrap();
            assert_eq!(third, utc(2025, 1, 3, 9, 0));
            assert_eq!(evaluator.compute_next_run(&rule, third).unwrap(), None);
        }

        #[test]
        fn test_end_date_stops_series() {
            let evaluator = ScheduleEvaluator::default();
            let rule = RecurrenceRule::weekly(utc(2025, 1, 6, 9, 0), "UTC").until(utc(2025, 1, 20, 9, 0));

            let occurrences = evaluator.preview(&rule, rule.anchor, 10).unwrap();
            assert_eq!(occurrences.len(), 3);
            assert_eq!(evaluator.compute_next_run(&rule, utc(2025, 1, 20, 9, 0)).unwrap(), None);
        }

        #[test]
        fn test_deterministic_for_same_input() {
            let evaluator = ScheduleEvaluator::default();
            let rule = RecurrenceRule::monthly(utc(2024, 2, 29, 7, 45), "Asia/Tokyo").every(5);
            let reference = utc(2027, 6, 1, 0, 0);

            let a = evaluator.compute_next_run(&rule, reference).unwrap();
            let b = evaluator.compute_next_run(&rule, reference).unwrap();
            assert_eq!(a, b);
        }
    }

    mod constrained_tests {
        use super::*;

        #[test]
        fn test_weekdays_constraint() {
            let evaluator = ScheduleEvaluator::default();
            let rule = RecurrenceRule::daily(utc(2025, 1, 3, 8, 0), "UTC").with_constraint(DayConstraint::Weekdays {
                days: vec![Weekday::Mon, Weekday::Tue, Weekday::Wed, Weekday::Thu, Weekday::Fri],
            });

            // Friday 2025-01-03 is followed by Monday 2025-01-06
            let next = evaluator.compute_next_run(&rule, rule.anchor).unwrap();
            assert_eq!(next, Some(utc(2025, 1, 6, 8, 0)));
        }

        #[test]
        fn test_biweekly_on_two_days() {
            let evaluator = ScheduleEvaluator::default();
            let rule = RecurrenceRule::weekly(utc(2025, 1, 6, 10, 0), "UTC")
                .every(2)
                .with_constraint(DayConstraint::Weekdays { days: vec![Weekday::Mon, Weekday::Thu] });

            let occurrences = evaluator.preview(&rule, rule.anchor, 4).unwrap();
            assert_eq!(
                occurrences,
                vec![
                    utc(2025, 1, 6, 10, 0),
                    utc(2025, 1, 9, 10, 0),
                    utc(2025, 1, 20, 10, 0),
                    utc(2025, 1, 23, 10, 0),
                ]
            );
        }

        #[test]
        fn test_last_business_day_of_month() {
            let evaluator = ScheduleEvaluator::default();
            let rule = RecurrenceRule::monthly(utc(2025, 1, 1, 17, 0), "UTC").with_constraint(DayConstraint::LastBusinessDay);

            let occurrences = evaluator.preview(&rule, rule.anchor, 5).unwrap();
            assert_eq!(
                occurrences,
                vec![
                    utc(2025, 1, 31, 17, 0),
                    utc(2025, 2, 28, 17, 0),
                    utc(2025, 3, 31, 17, 0),
                    utc(2025, 4, 30, 17, 0),
                    utc(2025, 5, 30, 17, 0), // May 31st is a Saturday
                ]
            );
        }

        #[rstest]
        #[case(DayConstraint::NthWeekday { n: 2, weekday: Weekday::Tue }, utc(2025, 1, 14, 9, 0))]
        #[case(DayConstraint::NthWeekday { n: -1, weekday: Weekday::Fri }, utc(2025, 1, 31, 9, 0))]
        #[case(DayConstraint::MonthDays { days: vec![-1] }, utc(2025, 1, 31, 9, 0))]
        #[case(DayConstraint::MonthDays { days: vec![15, 1] }, utc(2025, 1, 15, 9, 0))]
        fn test_monthly_constraints(#[case] constraint: DayConstraint, #[case] expected: DateTime<Utc>) {
            let evaluator = ScheduleEvaluator::default();
            let rule = RecurrenceRule::monthly(utc(2025, 1, 1, 9, 0), "UTC").with_constraint(constraint);

            assert_eq!(evaluator.compute_next_run(&rule, rule.anchor).unwrap(), Some(expected));
        }

        #[test]
        fn test_custom_predicate() {
            let evaluator = ScheduleEvaluator::default().with_predicate("payday", |date: NaiveDate| date.day() == 25);
            let rule = RecurrenceRule::monthly(utc(2025, 1, 1, 9, 0), "UTC").with_constraint(DayConstraint::Custom {
                name: "payday".to_string(),
            });

            assert!(evaluator.validate(&rule).is_ok());
            assert_eq!(evaluator.first_run(&rule, rule.anchor).unwrap(), Some(utc(2025, 1, 25, 9, 0)));
        }

        #[test]
        fn test_unmatchable_predicate_is_bounded() {
            let evaluator = ScheduleEvaluator::new(60).with_predicate("never", |_: NaiveDate| false);
            let rule = RecurrenceRule::daily(utc(2025, 1, 1, 9, 0), "UTC").with_constraint(DayConstraint::Custom {
                name: "never".to_string(),
            });

            let result = evaluator.compute_next_run(&rule, rule.anchor);
            assert!(matches!(result, Err(CoreError::InvalidRule(_))));
        }

        #[rstest]
        #[case::every_third_year_on_the_first(
            RecurrenceRule::new(Frequency::Yearly, utc(2025, 1, 1, 9, 0), "UTC")
                .every(3)
                .with_constraint(DayConstraint::MonthDays { days: vec![1] }),
            utc(2025, 12, 1, 9, 0),
            utc(2028, 1, 1, 9, 0)
        )]
        #[case::every_25_months_on_last_business_day(
            RecurrenceRule::monthly(utc(2025, 1, 1, 17, 0), "UTC")
                .every(25)
                .with_constraint(DayConstraint::LastBusinessDay),
            utc(2025, 1, 31, 17, 0),
            utc(2027, 2, 26, 17, 0) // Feb 28th 2027 is a Sunday
        )]
        fn test_long_gaps_between_active_periods(
            #[case] rule: RecurrenceRule,
            #[case] after: DateTime<Utc>,
            #[case] expected: DateTime<Utc>,
        ) {
            let evaluator = ScheduleEvaluator::default();

            assert!(evaluator.validate(&rule).is_ok());
            assert_eq!(evaluator.compute_next_run(&rule, after).unwrap(), Some(expected));
        }

        #[test]
        fn test_count_limit_spans_inactive_periods() {
            let evaluator = ScheduleEvaluator::default();
            let rule = RecurrenceRule::new(Frequency::Yearly, utc(2025, 1, 1, 9, 0), "UTC")
                .every(3)
                .with_constraint(DayConstraint::MonthDays { days: vec![1] })
                .limit(13);

            let occurrences = evaluator.preview(&rule, rule.anchor, 20).unwrap();
            assert_eq!(occurrences.len(), 13);
            assert_eq!(occurrences.last(), Some(&utc(2028, 1, 1, 9, 0)));
        }

        #[test]
        fn test_constrained_count_limit() {
            let evaluator = ScheduleEvaluator::default();
            let rule = RecurrenceRule::weekly(utc(2025, 1, 6, 9, 0), "UTC")
                .with_constraint(DayConstraint::Weekdays { days: vec![Weekday::Mon, Weekday::Wed] })
                .limit(3);

            let occurrences = evaluator.preview(&rule, rule.anchor, 10).unwrap();
            assert_eq!(
                occurrences,
                vec![utc(2025, 1, 6, 9, 0), utc(2025, 1, 8, 9, 0), utc(2025, 1, 13, 9, 0)]
            );
        }
    }

    mod validation_tests {
        use super::*;

        #[rstest]
        #[case(RecurrenceRule::daily(utc(2025, 1, 1, 9, 0), "UTC").every(0))]
        #[case(RecurrenceRule::daily(utc(2025, 1, 1, 9, 0), "Mars/Olympus"))]
        #[case(RecurrenceRule::daily(utc(2025, 1, 1, 9, 0), "UTC").limit(0))]
        #[case(RecurrenceRule::daily(utc(2025, 1, 1, 9, 0), "UTC").limit(2).until(utc(2025, 2, 1, 0, 0)))]
        #[case(RecurrenceRule::daily(utc(2025, 1, 1, 9, 0), "UTC").until(utc(2024, 12, 1, 0, 0)))]
        #[case(RecurrenceRule::daily(utc(2025, 1, 1, 9, 0), "UTC").with_constraint(DayConstraint::Weekdays { days: vec![] }))]
        #[case(RecurrenceRule::weekly(utc(2025, 1, 1, 9, 0), "UTC").with_constraint(DayConstraint::LastBusinessDay))]
        #[case(RecurrenceRule::monthly(utc(2025, 1, 1, 9, 0), "UTC").with_constraint(DayConstraint::MonthDays { days: vec![32] }))]
        #[case(RecurrenceRule::monthly(utc(2025, 1, 1, 9, 0), "UTC").with_constraint(DayConstraint::Custom { name: "unknown".to_string() }))]
        fn test_rejects_malformed_rules(#[case] rule: RecurrenceRule) {
            let evaluator = ScheduleEvaluator::default();
            assert!(matches!(evaluator.validate(&rule), Err(CoreError::InvalidRule(_))));
        }

        #[test]
        fn test_accepts_well_formed_rules() {
            let evaluator = ScheduleEvaluator::default();
            let rule = RecurrenceRule::monthly(utc(2025, 1, 1, 9, 0), "Europe/Paris")
                .every(2)
                .with_constraint(DayConstraint::NthWeekday { n: 1, weekday: Weekday::Mon })
                .until(utc(2026, 1, 1, 0, 0));

            assert!(evaluator.validate(&rule).is_ok());
        }

        #[test]
        fn test_to_rrule() {
            let rule = RecurrenceRule::monthly(utc(2025, 1, 1, 9, 0), "UTC")
                .with_constraint(DayConstraint::LastBusinessDay)
                .limit(6);
            assert_eq!(
                rule.to_rrule().as_deref(),
                Some("FREQ=MONTHLY;INTERVAL=1;BYDAY=MO,TU,WE,TH,FR;BYSETPOS=-1;COUNT=6")
            );

            let custom = rule.with_constraint(DayConstraint::Custom { name: "x".to_string() });
            assert_eq!(custom.to_rrule(), None);
        }

        #[test]
        fn test_rule_serde_shape() {
            let rule = RecurrenceRule::weekly(utc(2025, 1, 6, 9, 0), "UTC")
                .with_constraint(DayConstraint::Weekdays { days: vec![Weekday::Mon] });
            let json = serde_json::to_value(&rule).unwrap();
            assert_eq!(json["frequency"], "weekly");
            assert_eq!(json["constraint"]["kind"], "weekdays");

            let back: RecurrenceRule = serde_json::from_value(json).unwrap();
            assert_eq!(back, rule);
        }
    }

    proptest! {
        #[test]
        fn prop_fixed_interval_sequence_has_constant_spacing(
            interval in 1u32..30,
            weekly in any::<bool>(),
            offset_minutes in 0i64..(60 * 24 * 365),
            steps in 2usize..12,
        ) {
            let evaluator = ScheduleEvaluator::default();
            let anchor = utc(2024, 1, 1, 0, 0) + Duration::minutes(offset_minutes);
            let frequency = if weekly { Frequency::Weekly } else { Frequency::Daily };
            let rule = RecurrenceRule::new(frequency, anchor, "UTC").every(interval);
            let unit_days = if weekly { 7 } else { 1 };
            let spacing = Duration::days(unit_days * interval as i64);

            let mut previous = evaluator.first_run(&rule, anchor).unwrap().unwrap();
            prop_assert_eq!(previous, anchor);
            for _ in 0..steps {
                let next = evaluator.compute_next_run(&rule, previous).unwrap().unwrap();
                prop_assert!(next > previous);
                prop_assert_eq!(next - previous, spacing);
                previous = next;
            }
        }
    }
}
