// src/expr/ops/date.rs
// Date component extraction, formatting and calendar arithmetic. All
// computation is UTC; the engine does not model timezones.

use bson::Bson;
use chrono::{DateTime, Datelike, Duration, Months, TimeZone, Timelike, Utc};

use crate::error::{Result, SiftError};
use crate::expr::eval::{nullish, require_args};
use crate::expr::{check_named_args, named_arg, EvalCtx, Expression};

use super::Registry;

pub(super) fn register(registry: &mut Registry) {
    registry.insert("$dateAdd", op_date_add);
    registry.insert("$dateDiff", op_date_diff);
    registry.insert("$dateFromParts", op_date_from_parts);
    registry.insert("$dateToString", op_date_to_string);
    registry.insert("$dayOfMonth", |ctx, arg| component(ctx, arg, "$dayOfMonth", |d| d.day() as i32));
    registry.insert("$dayOfWeek", |ctx, arg| {
        component(ctx, arg, "$dayOfWeek", |d| {
            d.weekday().num_days_from_sunday() as i32 + 1
        })
    });
    registry.insert("$dayOfYear", |ctx, arg| component(ctx, arg, "$dayOfYear", |d| d.ordinal() as i32));
    registry.insert("$hour", |ctx, arg| component(ctx, arg, "$hour", |d| d.hour() as i32));
    registry.insert("$isoDayOfWeek", |ctx, arg| {
        component(ctx, arg, "$isoDayOfWeek", |d| {
            d.weekday().number_from_monday() as i32
        })
    });
    registry.insert("$isoWeek", |ctx, arg| {
        component(ctx, arg, "$isoWeek", |d| d.iso_week().week() as i32)
    });
    registry.insert("$isoWeekYear", |ctx, arg| {
        component(ctx, arg, "$isoWeekYear", |d| d.iso_week().year())
    });
    registry.insert("$millisecond", |ctx, arg| {
        component(ctx, arg, "$millisecond", |d| {
            (d.timestamp_subsec_millis()) as i32
        })
    });
    registry.insert("$minute", |ctx, arg| component(ctx, arg, "$minute", |d| d.minute() as i32));
    registry.insert("$month", |ctx, arg| component(ctx, arg, "$month", |d| d.month() as i32));
    registry.insert("$second", |ctx, arg| component(ctx, arg, "$second", |d| d.second() as i32));
    registry.insert("$week", |ctx, arg| component(ctx, arg, "$week", sunday_week));
    registry.insert("$year", |ctx, arg| component(ctx, arg, "$year", |d| d.year()));
}

/// Sunday-start week of year, 0-53: days before the first Sunday are week 0.
fn sunday_week(d: &DateTime<Utc>) -> i32 {
    let ordinal0 = d.ordinal0() as i32;
    let weekday_sun0 = d.weekday().num_days_from_sunday() as i32;
    (ordinal0 + 7 - weekday_sun0) / 7
}

fn as_datetime(operator: &'static str, value: &Bson) -> Result<DateTime<Utc>> {
    match value {
        Bson::DateTime(dt) => Ok(dt.to_chrono()),
        Bson::Timestamp(ts) => Ok(Utc
            .timestamp_opt(ts.time as i64, 0)
            .single()
            .unwrap_or_else(|| Utc.timestamp_nanos(0))),
        other => Err(SiftError::type_mismatch(
            operator,
            format!("expected a date, got {:?}", other),
        )),
    }
}

fn component(
    ctx: &EvalCtx,
    arg: &Expression,
    operator: &'static str,
    extract: fn(&DateTime<Utc>) -> i32,
) -> Result<Bson> {
    // Both {$year: expr} and {$year: {date: expr}} are accepted.
    let value = match arg {
        Expression::Document(fields) if named_arg(fields, "date").is_some() => {
            check_named_args(fields, operator, &["date", "timezone"])?;
            reject_timezone(ctx, fields, operator)?;
            ctx.compute(named_arg(fields, "date").expect("checked"))?
        }
        _ => {
            let args = ctx.eval_operands(arg)?;
            require_args(operator, &args, 1)?;
            args.into_iter().next().expect("len checked")
        }
    };
    if nullish(&value) {
        return Ok(Bson::Null);
    }
    Ok(Bson::Int32(extract(&as_datetime(operator, &value)?)))
}

fn reject_timezone(
    ctx: &EvalCtx,
    fields: &[(String, Expression)],
    operator: &'static str,
) -> Result<()> {
    if let Some(tz) = named_arg(fields, "timezone") {
        let tz = ctx.compute(tz)?;
        if !nullish(&tz) && tz.as_str() != Some("UTC") {
            return Err(SiftError::Unsupported(format!(
                "{}: only UTC is supported",
                operator
            )));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// $dateToString
// ---------------------------------------------------------------------------

fn op_date_to_string(ctx: &EvalCtx, arg: &Expression) -> Result<Bson> {
    let fields = arg.named_args("$dateToString")?;
    check_named_args(fields, "$dateToString", &["date", "format", "timezone", "onNull"])?;
    reject_timezone(ctx, fields, "$dateToString")?;
    let date_expr = named_arg(fields, "date")
        .ok_or_else(|| SiftError::InvalidExpression("$dateToString requires date".into()))?;
    let format = match named_arg(fields, "format") {
        Some(expr) => match ctx.compute(expr)? {
            Bson::String(f) => f,
            _ => {
                return Err(SiftError::type_mismatch(
                    "$dateToString",
                    "format must be a string",
                ))
            }
        },
        None => "%Y-%m-%dT%H:%M:%S.%LZ".to_string(),
    };

    let date = ctx.compute(date_expr)?;
    if nullish(&date) {
        return match named_arg(fields, "onNull") {
            Some(expr) => ctx.compute(expr),
            None => Ok(Bson::Null),
        };
    }
    let dt = as_datetime("$dateToString", &date)?;
    Ok(Bson::String(format_date(&dt, &format)?))
}

/// MongoDB format specifiers, rendered by hand since %L, %w and %U differ
/// from strftime.
fn format_date(dt: &DateTime<Utc>, format: &str) -> Result<String> {
    let mut out = String::with_capacity(format.len() + 8);
    let mut chars = format.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('Y') => out.push_str(&format!("{:04}", dt.year())),
            Some('m') => out.push_str(&format!("{:02}", dt.month())),
            Some('d') => out.push_str(&format!("{:02}", dt.day())),
            Some('H') => out.push_str(&format!("{:02}", dt.hour())),
            Some('M') => out.push_str(&format!("{:02}", dt.minute())),
            Some('S') => out.push_str(&format!("{:02}", dt.second())),
            Some('L') => out.push_str(&format!("{:03}", dt.timestamp_subsec_millis())),
            Some('j') => out.push_str(&format!("{:03}", dt.ordinal())),
            Some('w') => out.push_str(&(dt.weekday().num_days_from_sunday() + 1).to_string()),
            Some('u') => out.push_str(&dt.weekday().number_from_monday().to_string()),
            Some('U') => out.push_str(&format!("{:02}", sunday_week(dt))),
            Some('V') => out.push_str(&format!("{:02}", dt.iso_week().week())),
            Some('G') => out.push_str(&format!("{:04}", dt.iso_week().year())),
            Some('z') => out.push_str("+0000"),
            Some('%') => out.push('%'),
            other => {
                return Err(SiftError::InvalidExpression(format!(
                    "$dateToString: unknown format specifier %{}",
                    other.map(String::from).unwrap_or_default()
                )))
            }
        }
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// $dateFromParts / $dateAdd / $dateDiff
// ---------------------------------------------------------------------------

fn int_part(ctx: &EvalCtx, fields: &[(String, Expression)], name: &str, default: i64) -> Result<i64> {
    match named_arg(fields, name) {
        Some(expr) => {
            let value = ctx.compute(expr)?;
            match value {
                Bson::Int32(n) => Ok(n as i64),
                Bson::Int64(n) => Ok(n),
                Bson::Double(f) if f.fract() == 0.0 => Ok(f as i64),
                other => Err(SiftError::type_mismatch(
                    "$dateFromParts",
                    format!("{} must be an integer, got {:?}", name, other),
                )),
            }
        }
        None => Ok(default),
    }
}

fn op_date_from_parts(ctx: &EvalCtx, arg: &Expression) -> Result<Bson> {
    let fields = arg.named_args("$dateFromParts")?;
    check_named_args(
        fields,
        "$dateFromParts",
        &["year", "month", "day", "hour", "minute", "second", "millisecond", "timezone"],
    )?;
    reject_timezone(ctx, fields, "$dateFromParts")?;
    if named_arg(fields, "year").is_none() {
        return Err(SiftError::InvalidExpression(
            "$dateFromParts requires year".into(),
        ));
    }

    let year = int_part(ctx, fields, "year", 0)?;
    let month = int_part(ctx, fields, "month", 1)?;
    let day = int_part(ctx, fields, "day", 1)?;
    let hour = int_part(ctx, fields, "hour", 0)?;
    let minute = int_part(ctx, fields, "minute", 0)?;
    let second = int_part(ctx, fields, "second", 0)?;
    let millisecond = int_part(ctx, fields, "millisecond", 0)?;

    // Build from January 1st and add offsets so out-of-range parts carry,
    // e.g. month 14 rolls into the next year.
    let base = chrono::NaiveDate::from_ymd_opt(year as i32, 1, 1)
        .ok_or_else(|| SiftError::type_mismatch("$dateFromParts", "year out of range"))?
        .and_hms_opt(0, 0, 0)
        .expect("midnight is valid");
    let with_months = if month >= 1 {
        base.checked_add_months(Months::new(month as u32 - 1))
    } else {
        base.checked_sub_months(Months::new((1 - month) as u32))
    }
    .ok_or_else(|| SiftError::type_mismatch("$dateFromParts", "month out of range"))?;

    let shifted = with_months
        + Duration::days(day - 1)
        + Duration::hours(hour)
        + Duration::minutes(minute)
        + Duration::seconds(second)
        + Duration::milliseconds(millisecond);
    let dt = Utc.from_utc_datetime(&shifted);
    Ok(Bson::DateTime(bson::DateTime::from_millis(
        dt.timestamp_millis(),
    )))
}

fn unit_name(ctx: &EvalCtx, fields: &[(String, Expression)], operator: &'static str) -> Result<String> {
    let unit_expr = named_arg(fields, "unit").ok_or_else(|| {
        SiftError::InvalidExpression(format!("{} requires unit", operator))
    })?;
    match ctx.compute(unit_expr)? {
        Bson::String(unit) => Ok(unit),
        other => Err(SiftError::type_mismatch(
            operator,
            format!("unit must be a string, got {:?}", other),
        )),
    }
}

fn op_date_add(ctx: &EvalCtx, arg: &Expression) -> Result<Bson> {
    let fields = arg.named_args("$dateAdd")?;
    check_named_args(fields, "$dateAdd", &["startDate", "unit", "amount", "timezone"])?;
    reject_timezone(ctx, fields, "$dateAdd")?;
    let start_expr = named_arg(fields, "startDate")
        .ok_or_else(|| SiftError::InvalidExpression("$dateAdd requires startDate".into()))?;
    let amount_expr = named_arg(fields, "amount")
        .ok_or_else(|| SiftError::InvalidExpression("$dateAdd requires amount".into()))?;

    let start = ctx.compute(start_expr)?;
    let amount = ctx.compute(amount_expr)?;
    if nullish(&start) || nullish(&amount) {
        return Ok(Bson::Null);
    }
    let start = as_datetime("$dateAdd", &start)?;
    let amount = match amount {
        Bson::Int32(n) => n as i64,
        Bson::Int64(n) => n,
        other => {
            return Err(SiftError::type_mismatch(
                "$dateAdd",
                format!("amount must be an integer, got {:?}", other),
            ))
        }
    };

    let unit = unit_name(ctx, fields, "$dateAdd")?;
    let result = match unit.as_str() {
        "year" => add_months(start, amount * 12)?,
        "quarter" => add_months(start, amount * 3)?,
        "month" => add_months(start, amount)?,
        "week" => start + Duration::weeks(amount),
        "day" => start + Duration::days(amount),
        "hour" => start + Duration::hours(amount),
        "minute" => start + Duration::minutes(amount),
        "second" => start + Duration::seconds(amount),
        "millisecond" => start + Duration::milliseconds(amount),
        other => {
            return Err(SiftError::InvalidExpression(format!(
                "$dateAdd: unknown unit {}",
                other
            )))
        }
    };
    Ok(Bson::DateTime(bson::DateTime::from_millis(
        result.timestamp_millis(),
    )))
}

fn add_months(start: DateTime<Utc>, months: i64) -> Result<DateTime<Utc>> {
    let naive = start.naive_utc();
    let shifted = if months >= 0 {
        naive.checked_add_months(Months::new(months as u32))
    } else {
        naive.checked_sub_months(Months::new((-months) as u32))
    }
    .ok_or_else(|| SiftError::type_mismatch("$dateAdd", "date out of range"))?;
    Ok(Utc.from_utc_datetime(&shifted))
}

fn op_date_diff(ctx: &EvalCtx, arg: &Expression) -> Result<Bson> {
    let fields = arg.named_args("$dateDiff")?;
    check_named_args(
        fields,
        "$dateDiff",
        &["startDate", "endDate", "unit", "timezone", "startOfWeek"],
    )?;
    reject_timezone(ctx, fields, "$dateDiff")?;
    let start_expr = named_arg(fields, "startDate")
        .ok_or_else(|| SiftError::InvalidExpression("$dateDiff requires startDate".into()))?;
    let end_expr = named_arg(fields, "endDate")
        .ok_or_else(|| SiftError::InvalidExpression("$dateDiff requires endDate".into()))?;

    let start = ctx.compute(start_expr)?;
    let end = ctx.compute(end_expr)?;
    if nullish(&start) || nullish(&end) {
        return Ok(Bson::Null);
    }
    let start = as_datetime("$dateDiff", &start)?;
    let end = as_datetime("$dateDiff", &end)?;

    // Boundary crossings, not elapsed time: day diff of 23:59 -> 00:01 is 1.
    let unit = unit_name(ctx, fields, "$dateDiff")?;
    let diff = match unit.as_str() {
        "year" => (end.year() - start.year()) as i64,
        "quarter" => {
            let quarters = |d: &DateTime<Utc>| d.year() as i64 * 4 + (d.month0() / 3) as i64;
            quarters(&end) - quarters(&start)
        }
        "month" => {
            let months = |d: &DateTime<Utc>| d.year() as i64 * 12 + d.month0() as i64;
            months(&end) - months(&start)
        }
        "week" => {
            // Sunday-start weeks; epoch day 0 was a Thursday.
            let weeks = |d: &DateTime<Utc>| {
                (d.date_naive()
                    .signed_duration_since(chrono::NaiveDate::from_ymd_opt(1970, 1, 1).unwrap())
                    .num_days()
                    + 4)
                .div_euclid(7)
            };
            weeks(&end) - weeks(&start)
        }
        "day" => {
            end.date_naive()
                .signed_duration_since(start.date_naive())
                .num_days()
        }
        "hour" => {
            end.timestamp().div_euclid(3600) - start.timestamp().div_euclid(3600)
        }
        "minute" => end.timestamp().div_euclid(60) - start.timestamp().div_euclid(60),
        "second" => end.timestamp() - start.timestamp(),
        "millisecond" => end.timestamp_millis() - start.timestamp_millis(),
        other => {
            return Err(SiftError::InvalidExpression(format!(
                "$dateDiff: unknown unit {}",
                other
            )))
        }
    };
    Ok(Bson::Int64(diff))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::Options;
    use bson::{bson, doc};

    fn date(millis: i64) -> Bson {
        Bson::DateTime(bson::DateTime::from_millis(millis))
    }

    // 2021-03-14T09:56:53.589Z
    const PI_DAY: i64 = 1_615_715_813_589;

    fn eval(spec: Bson) -> Result<Bson> {
        let options = Options::default();
        let expr = Expression::parse(&spec, &options)?;
        let doc = doc! {"when": date(PI_DAY)};
        EvalCtx::new(&doc, &options).compute(&expr)
    }

    #[test]
    fn test_components() {
        assert_eq!(eval(bson!({"$year": "$when"})).unwrap(), Bson::Int32(2021));
        assert_eq!(eval(bson!({"$month": "$when"})).unwrap(), Bson::Int32(3));
        assert_eq!(eval(bson!({"$dayOfMonth": "$when"})).unwrap(), Bson::Int32(14));
        assert_eq!(eval(bson!({"$hour": "$when"})).unwrap(), Bson::Int32(9));
        assert_eq!(eval(bson!({"$minute": "$when"})).unwrap(), Bson::Int32(56));
        assert_eq!(eval(bson!({"$second": "$when"})).unwrap(), Bson::Int32(53));
        assert_eq!(eval(bson!({"$millisecond": "$when"})).unwrap(), Bson::Int32(589));
        // 2021-03-14 was a Sunday.
        assert_eq!(eval(bson!({"$dayOfWeek": "$when"})).unwrap(), Bson::Int32(1));
        assert_eq!(eval(bson!({"$isoDayOfWeek": "$when"})).unwrap(), Bson::Int32(7));
        assert_eq!(eval(bson!({"$dayOfYear": "$when"})).unwrap(), Bson::Int32(73));
    }

    #[test]
    fn test_component_null_propagates() {
        assert_eq!(eval(bson!({"$year": "$missing"})).unwrap(), Bson::Null);
    }

    #[test]
    fn test_week_numbering() {
        // Jan 1 2024 (Monday) is in Sunday-week 0; Jan 7 2024 (Sunday) opens week 1.
        let jan1 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let jan7 = Utc.with_ymd_and_hms(2024, 1, 7, 0, 0, 0).unwrap();
        assert_eq!(sunday_week(&jan1), 0);
        assert_eq!(sunday_week(&jan7), 1);
    }

    #[test]
    fn test_date_to_string() {
        assert_eq!(
            eval(bson!({"$dateToString": {"date": "$when", "format": "%Y-%m-%d"}})).unwrap(),
            bson!("2021-03-14")
        );
        assert_eq!(
            eval(bson!({"$dateToString": {"date": "$when"}})).unwrap(),
            bson!("2021-03-14T09:56:53.589Z")
        );
        assert_eq!(
            eval(bson!({"$dateToString": {"date": "$missing", "onNull": "n/a"}})).unwrap(),
            bson!("n/a")
        );
        assert_eq!(
            eval(bson!({"$dateToString": {"date": "$when", "format": "100%%"}})).unwrap(),
            bson!("100%")
        );
        assert!(eval(bson!({"$dateToString": {"date": "$when", "format": "%Q"}})).is_err());
    }

    #[test]
    fn test_date_from_parts_with_carry() {
        let got = eval(bson!({"$dateFromParts": {"year": 2020, "month": 14, "day": 1}})).unwrap();
        let dt = as_datetime("$test", &got).unwrap();
        assert_eq!((dt.year(), dt.month()), (2021, 2));
    }

    #[test]
    fn test_date_add() {
        let got = eval(bson!({"$dateAdd": {
            "startDate": "$when", "unit": "day", "amount": 1
        }}))
        .unwrap();
        let dt = as_datetime("$test", &got).unwrap();
        assert_eq!(dt.day(), 15);

        let got = eval(bson!({"$dateAdd": {
            "startDate": "$when", "unit": "month", "amount": -3
        }}))
        .unwrap();
        let dt = as_datetime("$test", &got).unwrap();
        assert_eq!((dt.year(), dt.month()), (2020, 12));
    }

    #[test]
    fn test_date_diff_counts_boundaries() {
        let a = date(86_400_000 - 1_000); // 1970-01-01T23:59:59
        let b = date(86_400_000 + 1_000); // 1970-01-02T00:00:01
        let options = Options::default();
        let spec = bson!({"$dateDiff": {"startDate": a, "endDate": b, "unit": "day"}});
        let expr = Expression::parse(&spec, &options).unwrap();
        let doc = doc! {};
        let got = EvalCtx::new(&doc, &options).compute(&expr).unwrap();
        assert_eq!(got, Bson::Int64(1));
    }
}
