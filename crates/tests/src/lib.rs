
#[cfg(test)]
mod message_tests;
#[cfg(test)]
mod thread_tests;
#[cfg(test)]
mod moderation_tests;
#[cfg(test)]
mod scenario_tests;
