//! Build timing: interval, multiple and time-of-day triggers plus pause windows.

use cadence_core::agent::AgentFilter;
use cadence_core::plugin::PluginSpec;
use cadence_core::ports::Builder;
use cadence_core::{Error, Result};
use chrono::{Datelike, Duration, NaiveDateTime, NaiveTime, Timelike, Weekday};
use std::fmt;
use std::sync::Arc;

/// Default time between modification checks.
pub const DEFAULT_INTERVAL_SECS: i64 = 300;

/// A wall-clock time at minute resolution, written `HHmm` in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TimeOfDay {
    hour: u32,
    minute: u32,
}

impl TimeOfDay {
    pub fn new(hour: u32, minute: u32) -> Result<Self> {
        if hour > 23 || minute > 59 {
            return Err(Error::Configuration(format!(
                "invalid time of day {:02}{:02}",
                hour, minute
            )));
        }
        Ok(Self { hour, minute })
    }

    /// Parse `HHmm`, e.g. `1200` or `0930`.
    pub fn parse(value: &str) -> Result<Self> {
        let invalid = || Error::Configuration(format!("invalid time '{}', expected HHmm", value));
        if value.len() != 4 || !value.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        let hour = value[..2].parse().map_err(|_| invalid())?;
        let minute = value[2..].parse().map_err(|_| invalid())?;
        Self::new(hour, minute).map_err(|_| invalid())
    }

    pub fn of(time: &NaiveDateTime) -> Self {
        Self {
            hour: time.hour(),
            minute: time.minute(),
        }
    }

    /// Today's occurrence of this time, keeping the seconds of `now`.
    fn on_same_day(&self, now: &NaiveDateTime) -> NaiveDateTime {
        NaiveTime::from_hms_nano_opt(self.hour, self.minute, now.second(), now.nanosecond())
            .map(|t| now.date().and_time(t))
            .unwrap_or(*now)
    }

    /// The first occurrence strictly after `now`, restricted to `day` if given.
    pub fn next_after(&self, now: &NaiveDateTime, day: Option<Weekday>) -> NaiveDateTime {
        let mut next = self.on_same_day(now);
        if next <= *now {
            next += Duration::days(1);
        }
        if let Some(day) = day {
            while next.weekday() != day {
                next += Duration::days(1);
            }
        }
        next
    }

    /// Today's trigger instant at second zero.
    fn at_minute_start(&self, date: chrono::NaiveDate) -> NaiveDateTime {
        NaiveTime::from_hms_opt(self.hour, self.minute, 0)
            .map(|t| date.and_time(t))
            .unwrap_or_else(|| date.and_time(NaiveTime::MIN))
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}{:02}", self.hour, self.minute)
    }
}

/// Parse a weekday name such as `monday` or `Mon`.
pub fn parse_weekday(value: &str) -> Result<Weekday> {
    value
        .parse()
        .map_err(|_| Error::Configuration(format!("invalid day '{}'", value)))
}

/// When a scheduled build applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Applies on every N-th build. `Multiple(1)` is a plain interval build.
    Multiple(u32),
    /// Applies once a day at a fixed time.
    Time(TimeOfDay),
}

/// A build executed on a remote agent.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteTarget {
    /// Builder the agent instantiates from its own registry.
    pub builder: PluginSpec,
    pub filter: AgentFilter,
    pub module: Option<String>,
}

#[derive(Clone)]
pub enum BuildTarget {
    Local(Arc<dyn Builder>),
    Remote(RemoteTarget),
}

impl BuildTarget {
    pub fn describe(&self) -> String {
        match self {
            BuildTarget::Local(builder) => format!("local {}", builder.name()),
            BuildTarget::Remote(remote) => format!("remote {}", remote.builder.tag),
        }
    }
}

impl fmt::Debug for BuildTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

#[derive(Debug, Clone)]
pub struct ScheduledBuild {
    pub trigger: Trigger,
    pub day: Option<Weekday>,
    pub target: BuildTarget,
}

impl ScheduledBuild {
    pub fn every(target: BuildTarget) -> Self {
        Self {
            trigger: Trigger::Multiple(1),
            day: None,
            target,
        }
    }

    pub fn at(time: TimeOfDay, target: BuildTarget) -> Self {
        Self {
            trigger: Trigger::Time(time),
            day: None,
            target,
        }
    }

    pub fn on(mut self, day: Weekday) -> Self {
        self.day = Some(day);
        self
    }

    fn valid_day(&self, now: &NaiveDateTime) -> bool {
        self.day.is_none_or(|d| d == now.weekday())
    }

    fn time(&self) -> Option<TimeOfDay> {
        match self.trigger {
            Trigger::Time(t) => Some(t),
            Trigger::Multiple(_) => None,
        }
    }
}

/// A window in which no builds start. May span midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PauseWindow {
    pub start: TimeOfDay,
    pub end: TimeOfDay,
    pub day: Option<Weekday>,
}

impl PauseWindow {
    pub fn new(start: TimeOfDay, end: TimeOfDay) -> Self {
        Self {
            start,
            end,
            day: None,
        }
    }

    fn spans_midnight(&self) -> bool {
        self.start > self.end
    }

    pub fn contains(&self, at: &NaiveDateTime) -> bool {
        if self.day.is_some_and(|d| d != at.weekday()) {
            return false;
        }
        let now = TimeOfDay::of(at);
        if self.spans_midnight() {
            now >= self.start || now <= self.end
        } else {
            self.start <= now && now <= self.end
        }
    }

    /// First instant after the window that contains `at`.
    fn resumes_at(&self, at: &NaiveDateTime) -> NaiveDateTime {
        let mut date = at.date();
        if self.spans_midnight() && TimeOfDay::of(at) >= self.start {
            date += Duration::days(1);
        }
        self.end.at_minute_start(date) + Duration::minutes(1)
    }
}

#[derive(Debug, Clone)]
pub struct Schedule {
    pub interval: Duration,
    pub builds: Vec<ScheduledBuild>,
    pub pauses: Vec<PauseWindow>,
}

impl Default for Schedule {
    fn default() -> Self {
        Self {
            interval: Duration::seconds(DEFAULT_INTERVAL_SECS),
            builds: Vec::new(),
            pauses: Vec::new(),
        }
    }
}

impl Schedule {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            ..Default::default()
        }
    }

    pub fn with_build(mut self, build: ScheduledBuild) -> Self {
        self.builds.push(build);
        self
    }

    pub fn with_pause(mut self, pause: PauseWindow) -> Self {
        self.pauses.push(pause);
        self
    }

    fn has_only_time_builds(&self) -> bool {
        !self.builds.is_empty() && self.builds.iter().all(|b| b.time().is_some())
    }

    pub fn is_paused(&self, at: &NaiveDateTime) -> bool {
        self.pauses.iter().any(|p| p.contains(at))
    }

    /// How long from `at` until no pause window applies. Zero if not paused.
    pub fn time_till_not_paused(&self, at: &NaiveDateTime) -> Duration {
        let mut resume = *at;
        // Adjacent windows chain; the bound keeps overlapping all-day windows finite.
        for _ in 0..=self.pauses.len() {
            match self.pauses.iter().find(|p| p.contains(&resume)) {
                Some(pause) => resume = pause.resumes_at(&resume),
                None => break,
            }
        }
        resume - *at
    }

    /// Time from `now` until the next build attempt. `interval` is what is left
    /// of the check interval; time builds cap it, and a schedule of only time
    /// builds ignores it. The result is pushed past any pause window.
    pub fn time_to_next_build(&self, now: NaiveDateTime, interval: Duration) -> Duration {
        let until_time_build = self
            .builds
            .iter()
            .filter_map(|b| b.time().map(|t| t.next_after(&now, b.day) - now))
            .min();

        let wait = match until_time_build {
            Some(t) if self.has_only_time_builds() => t,
            Some(t) => t.min(interval),
            None => interval,
        };

        wait + self.time_till_not_paused(&(now + wait))
    }

    /// The build that applies to build number `counter` at `now`, given the
    /// previous build at `last_build`.
    ///
    /// A time build whose trigger fell in `(last_build, now]` wins; otherwise
    /// the first build whose multiple divides the counter. A forced build
    /// outside any trigger gets the time build that fires next.
    pub fn select_build(
        &self,
        counter: u64,
        last_build: NaiveDateTime,
        now: NaiveDateTime,
    ) -> Option<&ScheduledBuild> {
        let found = self.builds.iter().find(|b| {
            if !b.valid_day(&now) {
                return false;
            }
            match b.trigger {
                Trigger::Time(t) => {
                    let fired = t.at_minute_start(now.date());
                    last_build < fired && fired <= now
                }
                Trigger::Multiple(n) => n > 0 && counter % u64::from(n) == 0,
            }
        });

        found.or_else(|| {
            self.builds
                .iter()
                .filter_map(|b| b.time().map(|t| (t.next_after(&now, b.day), b)))
                .min_by_key(|(next, _)| *next)
                .map(|(_, b)| b)
        })
    }
}

/// Whether a computed wait requires sleeping at all.
pub fn need_to_wait(wait: Duration) -> bool {
    wait > Duration::zero()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use cadence_core::build::{BuildContext, BuildProperties, ResultDocument};
    use chrono::NaiveDate;

    struct Named(&'static str);

    #[async_trait]
    impl Builder for Named {
        fn name(&self) -> &str {
            self.0
        }

        async fn build(&self, _: &BuildProperties, _: &BuildContext) -> Result<ResultDocument> {
            Ok(ResultDocument::success(self.0))
        }
    }

    fn local(name: &'static str) -> BuildTarget {
        BuildTarget::Local(Arc::new(Named(name)))
    }

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, mo, d)
            .unwrap()
            .and_hms_opt(h, mi, s)
            .unwrap()
    }

    fn name_of(build: Option<&ScheduledBuild>) -> String {
        build.map(|b| b.target.describe()).unwrap_or_default()
    }

    #[test]
    fn test_parse_time_of_day() {
        assert_eq!(TimeOfDay::parse("1200").unwrap(), TimeOfDay::new(12, 0).unwrap());
        assert_eq!(TimeOfDay::parse("0930").unwrap().to_string(), "0930");
        assert!(TimeOfDay::parse("2400").is_err());
        assert!(TimeOfDay::parse("12:00").is_err());
        assert!(TimeOfDay::parse("960").is_err());
    }

    #[test]
    fn test_noon_build_just_after_noon_waits_a_full_day() {
        let schedule = Schedule::default()
            .with_build(ScheduledBuild::at(TimeOfDay::parse("1200").unwrap(), local("noon")));
        let now = at(2001, 11, 22, 12, 0, 30);
        assert_eq!(
            schedule.time_to_next_build(now, Duration::seconds(300)),
            Duration::days(1)
        );
    }

    #[test]
    fn test_time_build_caps_interval() {
        let schedule = Schedule::default()
            .with_build(ScheduledBuild::every(local("quick")))
            .with_build(ScheduledBuild::at(TimeOfDay::parse("1205").unwrap(), local("nightly")));
        let now = at(2001, 11, 22, 12, 0, 0);
        assert_eq!(
            schedule.time_to_next_build(now, Duration::minutes(10)),
            Duration::minutes(5)
        );
        assert_eq!(
            schedule.time_to_next_build(now, Duration::minutes(2)),
            Duration::minutes(2)
        );
    }

    #[test]
    fn test_time_build_on_weekday() {
        // 2001-11-22 is a Thursday.
        let schedule = Schedule::default().with_build(
            ScheduledBuild::at(TimeOfDay::parse("0100").unwrap(), local("weekly"))
                .on(Weekday::Sat),
        );
        let now = at(2001, 11, 22, 0, 0, 0);
        assert_eq!(
            schedule.time_to_next_build(now, Duration::minutes(5)),
            Duration::days(2) + Duration::hours(1)
        );
    }

    #[test]
    fn test_pause_window_spanning_midnight() {
        let pause = PauseWindow::new(
            TimeOfDay::parse("2300").unwrap(),
            TimeOfDay::parse("0100").unwrap(),
        );
        assert!(pause.contains(&at(2001, 11, 22, 23, 30, 0)));
        assert!(pause.contains(&at(2001, 11, 23, 0, 59, 0)));
        assert!(!pause.contains(&at(2001, 11, 23, 1, 1, 0)));
        assert!(!pause.contains(&at(2001, 11, 22, 22, 59, 0)));

        let schedule = Schedule::default()
            .with_build(ScheduledBuild::every(local("quick")))
            .with_pause(pause);
        let now = at(2001, 11, 22, 22, 58, 0);
        // 22:58 + 5m lands inside the pause; resume at 01:01.
        assert_eq!(
            schedule.time_to_next_build(now, Duration::minutes(5)),
            at(2001, 11, 23, 1, 1, 0) - now
        );
    }

    #[test]
    fn test_pause_on_other_day_does_not_apply() {
        let mut pause = PauseWindow::new(
            TimeOfDay::parse("0000").unwrap(),
            TimeOfDay::parse("2359").unwrap(),
        );
        pause.day = Some(Weekday::Sun);
        let schedule = Schedule::default().with_pause(pause);
        assert!(!schedule.is_paused(&at(2001, 11, 22, 12, 0, 0)));
        assert!(schedule.is_paused(&at(2001, 11, 25, 12, 0, 0)));
    }

    #[test]
    fn test_select_time_build_in_window() {
        let schedule = Schedule::default()
            .with_build(ScheduledBuild::at(TimeOfDay::parse("1200").unwrap(), local("noon")))
            .with_build(ScheduledBuild::every(local("quick")));

        let last = at(2001, 11, 22, 11, 0, 0);
        let now = at(2001, 11, 22, 12, 0, 30);
        assert_eq!(name_of(schedule.select_build(3, last, now)), "local noon");

        let last = at(2001, 11, 22, 12, 0, 10);
        assert_eq!(name_of(schedule.select_build(3, last, now)), "local quick");
    }

    #[test]
    fn test_select_by_multiple() {
        let mut full = ScheduledBuild::every(local("full"));
        full.trigger = Trigger::Multiple(5);
        let schedule = Schedule::default()
            .with_build(full)
            .with_build(ScheduledBuild::every(local("quick")));

        let last = at(2001, 11, 22, 11, 0, 0);
        let now = at(2001, 11, 22, 12, 0, 0);
        assert_eq!(name_of(schedule.select_build(0, last, now)), "local full");
        assert_eq!(name_of(schedule.select_build(1, last, now)), "local quick");
        assert_eq!(name_of(schedule.select_build(10, last, now)), "local full");
    }

    #[test]
    fn test_forced_build_outside_trigger_uses_next_time_build() {
        let schedule = Schedule::default()
            .with_build(ScheduledBuild::at(TimeOfDay::parse("0200").unwrap(), local("early")))
            .with_build(ScheduledBuild::at(TimeOfDay::parse("1800").unwrap(), local("late")));
        let now = at(2001, 11, 22, 15, 0, 0);
        let last = at(2001, 11, 22, 14, 0, 0);
        assert_eq!(name_of(schedule.select_build(0, last, now)), "local late");
    }

    #[test]
    fn test_need_to_wait() {
        assert!(need_to_wait(Duration::milliseconds(1)));
        assert!(!need_to_wait(Duration::zero()));
        assert!(!need_to_wait(Duration::milliseconds(-1)));
    }
}
