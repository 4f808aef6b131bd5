mod clip_outcomes;
