//! Mobile User-Agent generator (spec §4.B.4). Upstream's SSO and attendance surfaces are
//! tuned for a specific mobile client; presenting a desktop or bot-shaped UA string changes
//! which HTML template comes back, so every Upstream Client call carries one of these.

// self
use crate::_prelude::*;

const ANDROID_VERSIONS: &[&str] = &["10", "11", "12", "13", "14"];
const DEVICE_MODELS: &[&str] =
	&["SM-G991B", "SM-A525F", "Redmi Note 11", "Pixel 6", "Pixel 7", "M2101K6G", "CPH2239"];
const CHROME_VERSIONS: &[&str] = &["112.0.5615.101", "116.0.5845.114", "120.0.6099.144", "124.0.6367.82"];

const IOS_VERSIONS: &[&str] = &["15_7", "16_5", "16_6", "17_1", "17_4"];
const IOS_DEVICES: &[&str] = &["iPhone", "iPad"];
const SAFARI_WEBKIT_VERSIONS: &[&str] = &["604.1", "605.1.15"];

/// Builds a plausible mobile User-Agent string, picking an Android/Chrome or iOS/Safari
/// shape at random and then each of its components independently (spec §4.B.4: Upstream's
/// mobile client ships for both platforms, so presenting only one shape would itself be a
/// detectable tell).
pub fn generate_random_mobile_user_agent() -> String {
	if rand::random_bool(0.5) { android_user_agent() } else { ios_user_agent() }
}

fn android_user_agent() -> String {
	let android = pick(ANDROID_VERSIONS);
	let device = pick(DEVICE_MODELS);
	let chrome = pick(CHROME_VERSIONS);

	format!(
		"Mozilla/5.0 (Linux; Android {android}; {device}) AppleWebKit/537.36 (KHTML, like Gecko) \
		 Chrome/{chrome} Mobile Safari/537.36"
	)
}

fn ios_user_agent() -> String {
	let ios = pick(IOS_VERSIONS);
	let device = pick(IOS_DEVICES);
	let webkit = pick(SAFARI_WEBKIT_VERSIONS);

	format!(
		"Mozilla/5.0 ({device}; CPU {device} OS {ios} like Mac OS X) AppleWebKit/{webkit} (KHTML, like Gecko) \
		 Mobile/15E148 Safari/{webkit}"
	)
}

fn pick(options: &[&str]) -> String {
	let index = rand::random_range(0..options.len());

	options[index].to_owned()
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	#[test]
	fn generated_user_agent_looks_like_a_mobile_browser() {
		let ua = generate_random_mobile_user_agent();
		let is_android = ua.starts_with("Mozilla/5.0 (Linux; Android ") && ua.contains("Mobile Safari/537.36");
		let is_ios = ua.contains("like Mac OS X") && ua.contains("Safari/");

		assert!(is_android || is_ios, "unexpected User-Agent shape: {ua}");
	}

	#[test]
	fn generated_user_agents_vary() {
		let samples: HashSet<String> = (0..50).map(|_| generate_random_mobile_user_agent()).collect();

		assert!(samples.len() > 1, "50 draws should not collapse onto a single string.");
	}

	#[test]
	fn both_platforms_appear_across_many_draws() {
		let samples: Vec<String> = (0..200).map(|_| generate_random_mobile_user_agent()).collect();

		assert!(samples.iter().any(|ua| ua.contains("Android")), "200 draws should include an Android UA.");
		assert!(samples.iter().any(|ua| ua.contains("like Mac OS X")), "200 draws should include an iOS UA.");
	}
}
